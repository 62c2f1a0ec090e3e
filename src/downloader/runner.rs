//! 单个任务的执行流程
//!
//! queued -> downloading -> [processing] -> finished
//!
//! 任何阶段失败都会进入 error，取消令牌触发后进入 cancelled，
//! 两种情况下任务目录都会被清理。

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::{DownloadError, DownloadResult, TimeoutPhase};
use super::extractor::{Extractor, SizeHint};
use super::processor::{AudioTarget, PostProcessor, ProcessPlan};
use super::progress::{ProgressThrottler, SpeedCalculator};
use super::storage::{output_file_name, JobStorage};
use super::store::JobStore;
use super::task::JobStatus;

/// 运行器参数
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// 进度写入间隔
    pub progress_interval: Duration,
    /// 单次读取的超时
    pub read_timeout: Duration,
    /// 写文件缓冲区大小
    pub write_buffer: usize,
    /// 音频任务的转码目标，None 表示保留原始音频流
    pub audio: Option<AudioTarget>,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            progress_interval: Duration::from_millis(super::progress::DEFAULT_THROTTLE_INTERVAL_MS),
            read_timeout: Duration::from_secs(30),
            write_buffer: 256 * 1024,
            audio: Some(AudioTarget::from_codec("mp3", "192k")),
        }
    }
}

/// 任务运行器
///
/// 无状态，可在多个任务间共享
pub struct JobRunner {
    store: Arc<JobStore>,
    storage: JobStorage,
    extractor: Arc<dyn Extractor>,
    processor: Arc<dyn PostProcessor>,
    settings: RunnerSettings,
}

impl JobRunner {
    pub fn new(
        store: Arc<JobStore>,
        storage: JobStorage,
        extractor: Arc<dyn Extractor>,
        processor: Arc<dyn PostProcessor>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            store,
            storage,
            extractor,
            processor,
            settings,
        }
    }

    pub fn storage(&self) -> &JobStorage {
        &self.storage
    }

    pub fn extractor(&self) -> &Arc<dyn Extractor> {
        &self.extractor
    }

    /// 执行任务直到终态，返回最终状态
    ///
    /// 执行过程中的 panic 也会被转换为 error 状态
    pub async fn run(&self, job_id: &str, cancel: CancellationToken) -> JobStatus {
        match self.store.get(job_id) {
            Ok(job) if job.status.is_terminal() => {
                debug!("任务 {} 已处于终态 {}，跳过执行", job_id, job.status.as_str());
                return job.status;
            }
            Ok(job) if job.cancel_requested => {
                info!("任务 {} 启动前已请求取消", job_id);
                return self.finish(job_id, Err(DownloadError::Cancelled), &cancel).await;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("任务 {} 无法执行: {}", job_id, e);
                return JobStatus::Error;
            }
        }

        let outcome = AssertUnwindSafe(self.execute(job_id, &cancel))
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "未知错误".to_string());
                error!("任务 {} 执行时发生 panic: {}", job_id, message);
                Err(DownloadError::Processing(format!("内部错误: {}", message)))
            }
        };

        self.finish(job_id, result, &cancel).await
    }

    async fn execute(&self, job_id: &str, cancel: &CancellationToken) -> DownloadResult<()> {
        let job = self.store.update(job_id, |j| j.mark_downloading())?;
        info!("开始下载任务: {} ({})", job_id, job.url);

        self.storage.prepare(job_id).await?;

        // 1. 解析
        let resolved = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            result = self.extractor.resolve(&job.url, &job.options) => result?,
        };
        debug!("任务 {} 解析完成: {:?}", job_id, resolved);

        let title = resolved.title.clone();
        let size_hint = resolved.size_hint;
        self.store.update(job_id, |j| {
            j.title = title;
            if let Some(hint) = size_hint {
                j.total_bytes = hint.value();
            }
        })?;

        // 2. 传输
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            result = resolved.source.open() => result?,
        };
        // 估算大小只用于进度，完整性只按准确长度校验
        let total = opened
            .content_length
            .or(size_hint.map(SizeHint::value))
            .filter(|t| *t > 0);
        let expected_len = opened
            .content_length
            .or(size_hint.and_then(SizeHint::exact))
            .filter(|t| *t > 0);
        let mut stream = opened.stream;

        let part_path = self.storage.part_path(job_id);
        let file = tokio::fs::File::create(&part_path).await?;
        let mut writer = BufWriter::with_capacity(self.settings.write_buffer, file);

        let throttler = ProgressThrottler::new(self.settings.progress_interval);
        let mut speed = SpeedCalculator::with_default_window();
        let mut downloaded: u64 = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                next = tokio::time::timeout(self.settings.read_timeout, stream.next()) => next,
            };

            let chunk = match next {
                Err(_) => {
                    return Err(DownloadError::Timeout {
                        phase: TimeoutPhase::Transfer,
                        secs: self.settings.read_timeout.as_secs(),
                    })
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => return Err(DownloadError::Transfer(e.to_string())),
                Ok(Some(Ok(chunk))) => chunk,
            };

            writer.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            speed.add_sample(chunk.len() as u64);

            if throttler.should_emit() {
                let current_speed = speed.speed();
                self.store
                    .update(job_id, |j| j.apply_transfer(downloaded, total, current_speed))?;
            }
        }
        writer.flush().await?;
        drop(writer);

        if let Some(expected) = expected_len {
            if downloaded < expected {
                return Err(DownloadError::Transfer(format!(
                    "数据不完整: 已接收 {} / {} 字节",
                    downloaded, expected
                )));
            }
        }

        // 估算值与实际不符时以实际接收量为准
        let final_total = expected_len.unwrap_or(downloaded);
        self.store
            .update(job_id, |j| j.apply_transfer(downloaded, Some(final_total), 0))?;
        info!("任务 {} 传输完成: {} 字节", job_id, downloaded);

        // 3. 后处理
        let (produced, ext) = match ProcessPlan::from_options(&job.options, self.settings.audio.as_ref()) {
            Some(plan) => {
                self.store.update(job_id, |j| j.mark_processing())?;
                let ext = plan.output_ext(&resolved.ext).to_string();
                let processed = self.storage.processing_path(job_id, &ext);
                info!("任务 {} 开始后处理: {:?}", job_id, plan);
                self.processor
                    .process(&part_path, &processed, &plan, cancel)
                    .await?;
                if let Err(e) = tokio::fs::remove_file(&part_path).await {
                    warn!("删除临时文件失败: {:?}, 错误: {}", part_path, e);
                }
                (processed, ext)
            }
            None => (part_path, resolved.ext.clone()),
        };

        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        // 4. 落盘
        let file_name = output_file_name(&resolved.title, &resolved.uploader, &ext);
        let final_path: PathBuf = self.storage.final_path(job_id, &file_name);
        tokio::fs::rename(&produced, &final_path).await?;
        let size = tokio::fs::metadata(&final_path).await?.len();

        self.store.update(job_id, |j| {
            j.downloaded_bytes = size;
            j.total_bytes = size;
            j.mark_finished(final_path.clone());
        })?;
        info!("任务 {} 已完成: {:?} ({} 字节)", job_id, final_path, size);
        Ok(())
    }

    /// 根据执行结果写入终态并清理
    async fn finish(
        &self,
        job_id: &str,
        result: DownloadResult<()>,
        cancel: &CancellationToken,
    ) -> JobStatus {
        let err = match result {
            Ok(()) => return JobStatus::Finished,
            Err(e) => e,
        };

        // 取消后读流、子进程等可能以其他错误结束，统一按取消处理
        let cancelled = matches!(err, DownloadError::Cancelled) || cancel.is_cancelled();

        let update = if cancelled {
            info!("任务 {} 已取消", job_id);
            self.store.update(job_id, |j| j.mark_cancelled())
        } else {
            error!("任务 {} 失败: {}", job_id, err);
            let message = err.to_string();
            self.store.update(job_id, |j| j.mark_error(message))
        };

        self.storage.discard(job_id).await;

        match update {
            Ok(job) => job.status,
            Err(e) => {
                warn!("任务 {} 写入终态失败: {}", job_id, e);
                self.store
                    .get(job_id)
                    .map(|j| j.status)
                    .unwrap_or(JobStatus::Error)
            }
        }
    }
}
