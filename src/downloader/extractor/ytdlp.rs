//! yt-dlp 解析后端
//!
//! 执行 `yt-dlp -J` 拿到页面的 JSON 描述，只使用其中的元信息和直链，
//! 实际传输由 [`HttpSource`] 完成。

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

use super::{
    ExtractError, Extractor, FormatInfo, HttpSource, MediaInfo, ResolvedMedia, SizeHint,
};
use crate::downloader::task::{DownloadOptions, DownloadType};

/// yt-dlp 输出的单个格式
#[derive(Debug, Clone, Default, Deserialize)]
pub struct YtDlpFormat {
    #[serde(default)]
    pub format_id: String,
    #[serde(default)]
    pub ext: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub filesize: Option<u64>,
    #[serde(default)]
    pub filesize_approx: Option<u64>,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
    /// 总码率 (kbit/s)
    #[serde(default)]
    pub tbr: Option<f64>,
    /// 音频码率 (kbit/s)
    #[serde(default)]
    pub abr: Option<f64>,
    #[serde(default)]
    pub http_headers: HashMap<String, String>,
}

impl YtDlpFormat {
    fn has_video(&self) -> bool {
        !matches!(self.vcodec.as_deref(), Some("none"))
    }

    fn has_audio(&self) -> bool {
        !matches!(self.acodec.as_deref(), Some("none"))
    }

    /// 只有普通 HTTP 直链可以流式传输，m3u8/dash 分片需要合并
    fn is_direct(&self) -> bool {
        self.url.is_some()
            && matches!(self.protocol.as_deref(), None | Some("http") | Some("https"))
    }

    /// filesize 是准确值，filesize_approx 只是估算
    fn size(&self) -> Option<SizeHint> {
        self.filesize
            .map(SizeHint::Exact)
            .or(self.filesize_approx.map(SizeHint::Approx))
    }

    fn to_info(&self) -> FormatInfo {
        FormatInfo {
            format_id: self.format_id.clone(),
            ext: self.ext.clone(),
            resolution: self
                .resolution
                .clone()
                .unwrap_or_else(|| "N/A".to_string()),
            filesize: self.filesize,
            vcodec: self.vcodec.clone().unwrap_or_else(|| "N/A".to_string()),
            acodec: self.acodec.clone().unwrap_or_else(|| "N/A".to_string()),
        }
    }
}

/// yt-dlp 输出的视频描述
#[derive(Debug, Clone, Default, Deserialize)]
struct YtDlpInfo {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    thumbnail: Option<String>,
    #[serde(default)]
    uploader: Option<String>,
    #[serde(default)]
    view_count: Option<u64>,
    #[serde(default)]
    formats: Vec<YtDlpFormat>,
    // 单文件站点没有 formats，直链在顶层
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    ext: Option<String>,
    #[serde(default)]
    http_headers: HashMap<String, String>,
}

impl YtDlpInfo {
    /// 单文件站点把顶层直链当作唯一格式
    fn candidate_formats(&self) -> Vec<YtDlpFormat> {
        if !self.formats.is_empty() {
            return self.formats.clone();
        }
        match &self.url {
            Some(url) => vec![YtDlpFormat {
                format_id: "0".to_string(),
                ext: self.ext.clone().unwrap_or_else(|| "mp4".to_string()),
                url: Some(url.clone()),
                http_headers: self.http_headers.clone(),
                ..Default::default()
            }],
            None => Vec::new(),
        }
    }
}

/// 按下载类型和格式选择一条流
///
/// - audio: 纯音频流中音频码率最高者
/// - video: 音视频合一的流，优先匹配请求的容器，再按分辨率和码率排序
/// - full: 音视频合一的流中画质最高者，不限容器
pub fn select_format<'a>(
    formats: &'a [YtDlpFormat],
    options: &DownloadOptions,
) -> Option<&'a YtDlpFormat> {
    let direct = formats.iter().filter(|f| f.is_direct());
    let preferred_ext = options.format.preferred_ext();

    let score = |f: &YtDlpFormat| (f.height.unwrap_or(0), (f.tbr.unwrap_or(0.0) * 1000.0) as u64);

    match options.download_type {
        DownloadType::Audio => {
            let audio_only: Vec<&YtDlpFormat> = direct
                .filter(|f| f.has_audio() && !f.has_video())
                .collect();
            let pool: Vec<&YtDlpFormat> = match preferred_ext {
                Some(ext) if audio_only.iter().any(|f| f.ext == ext) => {
                    audio_only.into_iter().filter(|f| f.ext == ext).collect()
                }
                _ => audio_only,
            };
            pool.into_iter().max_by_key(|f| {
                (f.abr.or(f.tbr).unwrap_or(0.0) * 1000.0) as u64
            })
        }
        DownloadType::Video => {
            let combined: Vec<&YtDlpFormat> = direct
                .filter(|f| f.has_audio() && f.has_video())
                .collect();
            let pool: Vec<&YtDlpFormat> = match preferred_ext {
                Some(ext) if combined.iter().any(|f| f.ext == ext) => {
                    combined.into_iter().filter(|f| f.ext == ext).collect()
                }
                Some(_) => return None,
                None => combined,
            };
            pool.into_iter().max_by_key(|f| score(f))
        }
        DownloadType::Full => direct
            .filter(|f| f.has_audio() && f.has_video())
            .max_by_key(|f| score(f)),
    }
}

/// yt-dlp 解析器
pub struct YtDlpExtractor {
    binary: PathBuf,
    client: Client,
    timeout: Duration,
    user_agent: String,
    max_formats: usize,
}

impl YtDlpExtractor {
    pub fn new(
        binary: PathBuf,
        client: Client,
        timeout: Duration,
        user_agent: String,
        max_formats: usize,
    ) -> Self {
        Self {
            binary,
            client,
            timeout,
            user_agent,
            max_formats,
        }
    }

    async fn dump_json(&self, url: &str) -> Result<YtDlpInfo, ExtractError> {
        debug!("执行 yt-dlp 解析: {}", url);

        let child = Command::new(&self.binary)
            .arg("-J")
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg("--no-color")
            .arg("--user-agent")
            .arg(&self.user_agent)
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ExtractError::Backend(format!("无法启动 {:?}: {}", self.binary, e))
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ExtractError::Timeout(self.timeout.as_secs()))?
            .map_err(|e| ExtractError::Backend(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("yt-dlp 返回非零状态")
                .trim()
                .to_string();
            if message.contains("Unsupported URL") {
                return Err(ExtractError::Unsupported(url.to_string()));
            }
            return Err(ExtractError::Unreachable(message));
        }

        parse_info(&output.stdout)
    }
}

fn parse_info(stdout: &[u8]) -> Result<YtDlpInfo, ExtractError> {
    serde_json::from_slice(stdout)
        .map_err(|e| ExtractError::Backend(format!("无法解析 yt-dlp 输出: {}", e)))
}

fn to_media_info(info: &YtDlpInfo, max_formats: usize) -> MediaInfo {
    MediaInfo {
        title: info.title.clone().unwrap_or_else(|| "Unknown".to_string()),
        description: info.description.clone().unwrap_or_default(),
        duration: info.duration.map(|d| d.max(0.0) as u64).unwrap_or(0),
        thumbnail: info.thumbnail.clone().unwrap_or_default(),
        uploader: info.uploader.clone().unwrap_or_else(|| "Unknown".to_string()),
        view_count: info.view_count.unwrap_or(0),
        formats: info
            .formats
            .iter()
            .take(max_formats)
            .map(YtDlpFormat::to_info)
            .collect(),
    }
}

#[async_trait]
impl Extractor for YtDlpExtractor {
    fn name(&self) -> &str {
        "yt-dlp"
    }

    async fn probe(&self, url: &str) -> Result<MediaInfo, ExtractError> {
        let info = self.dump_json(url).await?;
        Ok(to_media_info(&info, self.max_formats))
    }

    async fn resolve(
        &self,
        url: &str,
        options: &DownloadOptions,
    ) -> Result<ResolvedMedia, ExtractError> {
        let info = self.dump_json(url).await?;
        let formats = info.candidate_formats();
        let chosen = select_format(&formats, options).ok_or_else(|| {
            ExtractError::NoMatchingFormat(format!(
                "{:?}/{:?} 在 {} 个格式中没有可直接下载的流",
                options.download_type,
                options.format,
                formats.len()
            ))
        })?;

        info!(
            "yt-dlp 选择格式: {} ({}, {:?})",
            chosen.format_id, chosen.ext, chosen.resolution
        );

        let mut headers = chosen.http_headers.clone();
        headers
            .entry("User-Agent".to_string())
            .or_insert_with(|| self.user_agent.clone());

        // is_direct 已保证 url 存在
        let stream_url = chosen.url.clone().unwrap_or_default();

        Ok(ResolvedMedia {
            title: info.title.clone().unwrap_or_else(|| "unknown_video".to_string()),
            uploader: info.uploader.clone().unwrap_or_default(),
            ext: chosen.ext.clone(),
            size_hint: chosen.size(),
            source: Box::new(HttpSource::new(
                self.client.clone(),
                stream_url,
                headers,
                self.timeout,
            )),
        })
    }
}
