//! 测试用的解析器和后处理器

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::error::{DownloadError, DownloadResult};
use super::extractor::{
    ExtractError, Extractor, FormatInfo, MediaInfo, MediaSource, OpenedStream, ResolvedMedia,
    SizeHint,
};
use super::processor::{PostProcessor, ProcessPlan};
use super::task::DownloadOptions;

/// 内存数据源
#[derive(Clone)]
struct MemorySource {
    chunks: Vec<Vec<u8>>,
    delay: Option<Duration>,
    gate: Option<Arc<Semaphore>>,
    content_length: Option<u64>,
}

#[async_trait]
impl MediaSource for MemorySource {
    async fn open(&self) -> Result<OpenedStream, ExtractError> {
        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|e| ExtractError::Backend(e.to_string()))?;
            permit.forget();
        }

        let delay = self.delay;
        let stream = futures::stream::iter(self.chunks.clone())
            .then(move |chunk| async move {
                if let Some(d) = delay {
                    tokio::time::sleep(d).await;
                }
                Ok::<_, std::io::Error>(Bytes::from(chunk))
            })
            .boxed();

        Ok(OpenedStream {
            stream,
            content_length: self.content_length,
        })
    }
}

/// 可配置的假解析器
#[derive(Clone)]
pub struct FakeExtractor {
    source: MemorySource,
    size_hint: Option<SizeHint>,
    info_delay: Option<Duration>,
    failure: Option<String>,
}

impl FakeExtractor {
    pub fn new(chunks: Vec<Vec<u8>>) -> Self {
        let total = chunks.iter().map(|c| c.len() as u64).sum();
        Self {
            source: MemorySource {
                chunks,
                delay: None,
                gate: None,
                content_length: Some(total),
            },
            size_hint: Some(SizeHint::Exact(total)),
            info_delay: None,
            failure: None,
        }
    }

    /// 所有调用都返回解析失败
    pub fn failing(message: &str) -> Self {
        let mut fake = Self::new(Vec::new());
        fake.failure = Some(message.to_string());
        fake
    }

    /// 每个数据块之前等待
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.source.delay = Some(delay);
        self
    }

    /// 打开数据流前需要从信号量取得许可
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.source.gate = Some(gate);
        self
    }

    /// 声明一个与实际数据不同的长度
    pub fn report_size(mut self, size: u64) -> Self {
        self.source.content_length = Some(size);
        self.size_hint = Some(SizeHint::Exact(size));
        self
    }

    /// 只给出估算大小，数据流不带长度
    pub fn approx_size(mut self, size: u64) -> Self {
        self.source.content_length = None;
        self.size_hint = Some(SizeHint::Approx(size));
        self
    }

    /// 查询视频信息前等待
    pub fn with_info_delay(mut self, delay: Duration) -> Self {
        self.info_delay = Some(delay);
        self
    }
}

#[async_trait]
impl Extractor for FakeExtractor {
    fn name(&self) -> &str {
        "fake"
    }

    async fn probe(&self, url: &str) -> Result<MediaInfo, ExtractError> {
        if let Some(delay) = self.info_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.failure {
            return Err(ExtractError::Unreachable(format!("{}: {}", message, url)));
        }
        Ok(MediaInfo {
            title: "Fake Video".to_string(),
            description: "for tests".to_string(),
            duration: 60,
            thumbnail: String::new(),
            uploader: "Tester".to_string(),
            view_count: 7,
            formats: vec![FormatInfo {
                format_id: "18".to_string(),
                ext: "mp4".to_string(),
                resolution: "640x360".to_string(),
                filesize: self.size_hint.and_then(SizeHint::exact),
                vcodec: "avc1".to_string(),
                acodec: "mp4a".to_string(),
            }],
        })
    }

    async fn resolve(
        &self,
        url: &str,
        _options: &DownloadOptions,
    ) -> Result<ResolvedMedia, ExtractError> {
        if let Some(message) = &self.failure {
            return Err(ExtractError::Unreachable(format!("{}: {}", message, url)));
        }
        Ok(ResolvedMedia {
            title: "Fake Video".to_string(),
            uploader: "Tester".to_string(),
            ext: "mp4".to_string(),
            size_hint: self.size_hint,
            source: Box::new(self.source.clone()),
        })
    }
}

/// 直接复制文件的后处理器
pub struct CopyProcessor;

#[async_trait]
impl PostProcessor for CopyProcessor {
    async fn process(
        &self,
        input: &Path,
        output: &Path,
        _plan: &ProcessPlan,
        cancel: &CancellationToken,
    ) -> DownloadResult<()> {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        tokio::fs::copy(input, output).await?;
        Ok(())
    }
}
