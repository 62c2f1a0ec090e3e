//! 视频解析适配层
//!
//! 编排器只依赖 [`Extractor`] / [`MediaSource`] 两个 trait：
//! - `probe` 返回展示用的元信息
//! - `resolve` 按下载类型和格式选出一条具体的流，返回可读取字节的句柄
//!
//! 具体实现：
//! - [`YtDlpExtractor`]: 调用 yt-dlp 可执行文件解析页面
//! - [`DirectHttpExtractor`]: 地址本身就是媒体文件
//! - [`ExtractorChain`]: 按顺序尝试多个后端，第一个成功者生效

mod direct;
mod ytdlp;

pub use direct::{DirectHttpExtractor, HttpSource};
pub use ytdlp::{select_format, YtDlpExtractor, YtDlpFormat};

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::error::{DownloadError, TimeoutPhase};
use super::task::DownloadOptions;

/// 字节流，错误统一为 io::Error
pub type ByteStream = BoxStream<'static, Result<Bytes, std::io::Error>>;

/// 解析层错误，对编排器不透明，只用于生成错误信息
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("不支持的地址: {0}")]
    Unsupported(String),

    #[error("无法访问: {0}")]
    Unreachable(String),

    #[error("没有匹配的格式: {0}")]
    NoMatchingFormat(String),

    #[error("解析超时（{0} 秒）")]
    Timeout(u64),

    #[error("解析器执行失败: {0}")]
    Backend(String),
}

impl From<ExtractError> for DownloadError {
    fn from(err: ExtractError) -> Self {
        match err {
            ExtractError::Timeout(secs) => DownloadError::Timeout {
                phase: TimeoutPhase::Extract,
                secs,
            },
            other => DownloadError::Extraction(other.to_string()),
        }
    }
}

/// 单个可用格式
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FormatInfo {
    pub format_id: String,
    pub ext: String,
    pub resolution: String,
    pub filesize: Option<u64>,
    pub vcodec: String,
    pub acodec: String,
}

/// 视频元信息（info 接口返回体）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaInfo {
    pub title: String,
    pub description: String,
    /// 时长（秒）
    pub duration: u64,
    pub thumbnail: String,
    pub uploader: String,
    pub view_count: u64,
    pub formats: Vec<FormatInfo>,
}

/// 打开后的字节流
pub struct OpenedStream {
    pub stream: ByteStream,
    /// 响应声明的长度
    pub content_length: Option<u64>,
}

impl std::fmt::Debug for OpenedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedStream")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// 可读取字节的媒体句柄
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn open(&self) -> Result<OpenedStream, ExtractError>;
}

/// 解析阶段得到的文件大小
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeHint {
    /// 准确长度，可用于校验数据完整性
    Exact(u64),
    /// 估算值，只用于进度和剩余时间
    Approx(u64),
}

impl SizeHint {
    pub fn value(self) -> u64 {
        match self {
            SizeHint::Exact(size) | SizeHint::Approx(size) => size,
        }
    }

    pub fn exact(self) -> Option<u64> {
        match self {
            SizeHint::Exact(size) => Some(size),
            SizeHint::Approx(_) => None,
        }
    }
}

/// 解析出的具体下载目标
pub struct ResolvedMedia {
    pub title: String,
    pub uploader: String,
    /// 文件扩展名（不带点）
    pub ext: String,
    /// 解析阶段得到的大小提示
    pub size_hint: Option<SizeHint>,
    pub source: Box<dyn MediaSource>,
}

impl std::fmt::Debug for ResolvedMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedMedia")
            .field("title", &self.title)
            .field("uploader", &self.uploader)
            .field("ext", &self.ext)
            .field("size_hint", &self.size_hint)
            .finish_non_exhaustive()
    }
}

/// 视频解析器
#[async_trait]
pub trait Extractor: Send + Sync {
    /// 后端名称，用于日志
    fn name(&self) -> &str;

    /// 获取元信息，不产生任何任务状态
    async fn probe(&self, url: &str) -> Result<MediaInfo, ExtractError>;

    /// 按下载选项解析出具体的流
    async fn resolve(
        &self,
        url: &str,
        options: &DownloadOptions,
    ) -> Result<ResolvedMedia, ExtractError>;
}

/// 多后端解析器，按顺序尝试
pub struct ExtractorChain {
    backends: Vec<Arc<dyn Extractor>>,
}

impl ExtractorChain {
    pub fn new(backends: Vec<Arc<dyn Extractor>>) -> Self {
        Self { backends }
    }
}

#[async_trait]
impl Extractor for ExtractorChain {
    fn name(&self) -> &str {
        "chain"
    }

    async fn probe(&self, url: &str) -> Result<MediaInfo, ExtractError> {
        let mut last_err = ExtractError::Unsupported(url.to_string());
        for backend in &self.backends {
            match backend.probe(url).await {
                Ok(info) => {
                    debug!("解析器 {} 成功获取信息: {}", backend.name(), url);
                    return Ok(info);
                }
                Err(e) => {
                    warn!("解析器 {} 获取信息失败: {}", backend.name(), e);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn resolve(
        &self,
        url: &str,
        options: &DownloadOptions,
    ) -> Result<ResolvedMedia, ExtractError> {
        let mut last_err = ExtractError::Unsupported(url.to_string());
        for backend in &self.backends {
            match backend.resolve(url, options).await {
                Ok(media) => {
                    debug!("解析器 {} 解析成功: {}", backend.name(), url);
                    return Ok(media);
                }
                Err(e) => {
                    warn!("解析器 {} 解析失败: {}", backend.name(), e);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing(&'static str);

    #[async_trait]
    impl Extractor for Failing {
        fn name(&self) -> &str {
            self.0
        }

        async fn probe(&self, url: &str) -> Result<MediaInfo, ExtractError> {
            Err(ExtractError::Unreachable(format!("{} {}", self.0, url)))
        }

        async fn resolve(
            &self,
            url: &str,
            _options: &DownloadOptions,
        ) -> Result<ResolvedMedia, ExtractError> {
            Err(ExtractError::Unreachable(format!("{} {}", self.0, url)))
        }
    }

    struct Fixed;

    #[async_trait]
    impl Extractor for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn probe(&self, _url: &str) -> Result<MediaInfo, ExtractError> {
            Ok(MediaInfo {
                title: "ok".to_string(),
                description: String::new(),
                duration: 1,
                thumbnail: String::new(),
                uploader: String::new(),
                view_count: 0,
                formats: vec![],
            })
        }

        async fn resolve(
            &self,
            url: &str,
            _options: &DownloadOptions,
        ) -> Result<ResolvedMedia, ExtractError> {
            Err(ExtractError::NoMatchingFormat(url.to_string()))
        }
    }

    #[tokio::test]
    async fn test_chain_falls_through_to_next_backend() {
        let chain = ExtractorChain::new(vec![Arc::new(Failing("first")), Arc::new(Fixed)]);
        let info = chain.probe("https://example.com/v").await.unwrap();
        assert_eq!(info.title, "ok");
    }

    #[tokio::test]
    async fn test_chain_reports_last_error() {
        let chain = ExtractorChain::new(vec![Arc::new(Fixed), Arc::new(Failing("last"))]);
        let err = chain
            .resolve("https://example.com/v", &DownloadOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("last"));
    }

    #[tokio::test]
    async fn test_empty_chain_is_unsupported() {
        let chain = ExtractorChain::new(vec![]);
        let err = chain.probe("https://example.com/v").await.unwrap_err();
        assert!(matches!(err, ExtractError::Unsupported(_)));
    }

    #[test]
    fn test_timeout_maps_to_extract_phase() {
        let err: DownloadError = ExtractError::Timeout(15).into();
        assert!(matches!(
            err,
            DownloadError::Timeout {
                phase: TimeoutPhase::Extract,
                secs: 15
            }
        ));
    }
}
