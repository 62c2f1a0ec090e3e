//! 直链下载：地址本身指向媒体文件

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::Client;
use tracing::debug;

use super::{
    ExtractError, Extractor, FormatInfo, MediaInfo, MediaSource, OpenedStream, ResolvedMedia,
    SizeHint,
};
use crate::downloader::task::DownloadOptions;

/// 基于 HTTP GET 的媒体句柄
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: Client,
    url: String,
    headers: HashMap<String, String>,
    /// 建立连接并拿到响应头的超时
    open_timeout: Duration,
}

impl HttpSource {
    pub fn new(
        client: Client,
        url: String,
        headers: HashMap<String, String>,
        open_timeout: Duration,
    ) -> Self {
        Self {
            client,
            url,
            headers,
            open_timeout,
        }
    }

    fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(k.as_bytes()),
                HeaderValue::from_str(v),
            ) {
                map.insert(name, value);
            }
        }
        map
    }
}

#[async_trait]
impl MediaSource for HttpSource {
    async fn open(&self) -> Result<OpenedStream, ExtractError> {
        let request = self.client.get(&self.url).headers(self.header_map()).send();
        let response = tokio::time::timeout(self.open_timeout, request)
            .await
            .map_err(|_| ExtractError::Timeout(self.open_timeout.as_secs()))?
            .map_err(|e| ExtractError::Unreachable(e.to_string()))?
            .error_for_status()
            .map_err(|e| ExtractError::Unreachable(e.to_string()))?;

        let content_length = response.content_length();
        debug!("已打开媒体流: {} (长度={:?})", self.url, content_length);

        let stream = response
            .bytes_stream()
            .map_err(std::io::Error::other);

        Ok(OpenedStream {
            stream: Box::pin(stream),
            content_length,
        })
    }
}

/// 直链解析器
///
/// 通过 HEAD 请求判断地址是否为媒体文件，文件名作为标题
pub struct DirectHttpExtractor {
    client: Client,
    timeout: Duration,
}

impl DirectHttpExtractor {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn head(&self, url: &str) -> Result<(Option<u64>, String), ExtractError> {
        let response = tokio::time::timeout(self.timeout, self.client.head(url).send())
            .await
            .map_err(|_| ExtractError::Timeout(self.timeout.as_secs()))?
            .map_err(|e| ExtractError::Unreachable(e.to_string()))?
            .error_for_status()
            .map_err(|e| ExtractError::Unreachable(e.to_string()))?;

        let headers = response.headers();
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        let length = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        Ok((length, content_type))
    }
}

/// 从地址最后一段路径推断文件名和扩展名
fn split_file_name(url: &str) -> (String, Option<String>) {
    let path = url
        .split(['?', '#'])
        .next()
        .unwrap_or(url)
        .trim_end_matches('/');
    let last = path.rsplit('/').next().unwrap_or("");
    let decoded = urlencoding::decode(last)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| last.to_string());

    match decoded.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() && ext.len() <= 5 => {
            (stem.to_string(), Some(ext.to_ascii_lowercase()))
        }
        _ => (decoded, None),
    }
}

/// 由 Content-Type 推断扩展名
fn ext_from_content_type(content_type: &str) -> Option<&'static str> {
    let mime = content_type.split(';').next().unwrap_or("").trim();
    match mime {
        "video/mp4" => Some("mp4"),
        "video/webm" => Some("webm"),
        "video/x-matroska" => Some("mkv"),
        "video/quicktime" => Some("mov"),
        "audio/mpeg" => Some("mp3"),
        "audio/mp4" => Some("m4a"),
        "audio/webm" => Some("weba"),
        "audio/ogg" => Some("ogg"),
        _ => None,
    }
}

fn is_media_type(content_type: &str) -> bool {
    content_type.starts_with("video/")
        || content_type.starts_with("audio/")
        || content_type.starts_with("application/octet-stream")
}

#[async_trait]
impl Extractor for DirectHttpExtractor {
    fn name(&self) -> &str {
        "direct"
    }

    async fn probe(&self, url: &str) -> Result<MediaInfo, ExtractError> {
        let (length, content_type) = self.head(url).await?;
        if !is_media_type(&content_type) {
            return Err(ExtractError::Unsupported(format!(
                "{} (Content-Type: {})",
                url, content_type
            )));
        }

        let (title, ext) = split_file_name(url);
        let ext = ext
            .or_else(|| ext_from_content_type(&content_type).map(str::to_string))
            .unwrap_or_else(|| "bin".to_string());
        let is_audio = content_type.starts_with("audio/");

        Ok(MediaInfo {
            title,
            description: String::new(),
            duration: 0,
            thumbnail: String::new(),
            uploader: String::new(),
            view_count: 0,
            formats: vec![FormatInfo {
                format_id: "direct".to_string(),
                ext,
                resolution: if is_audio { "audio only" } else { "N/A" }.to_string(),
                filesize: length,
                vcodec: if is_audio { "none" } else { "N/A" }.to_string(),
                acodec: "N/A".to_string(),
            }],
        })
    }

    async fn resolve(
        &self,
        url: &str,
        options: &DownloadOptions,
    ) -> Result<ResolvedMedia, ExtractError> {
        let info = self.probe(url).await?;
        let format = info
            .formats
            .into_iter()
            .next()
            .ok_or_else(|| ExtractError::NoMatchingFormat(url.to_string()))?;

        if let Some(wanted) = options.format.preferred_ext() {
            if format.ext != wanted {
                return Err(ExtractError::NoMatchingFormat(format!(
                    "直链文件格式为 {}，请求的是 {}",
                    format.ext, wanted
                )));
            }
        }

        Ok(ResolvedMedia {
            title: info.title,
            uploader: info.uploader,
            ext: format.ext,
            size_hint: format.filesize.map(SizeHint::Exact),
            source: Box::new(HttpSource::new(
                self.client.clone(),
                url.to_string(),
                HashMap::new(),
                self.timeout,
            )),
        })
    }
}
