use crate::config::{AppConfig, RetentionConfig};
use crate::downloader::error::{DownloadError, DownloadResult, TimeoutPhase};
use crate::downloader::extractor::{
    DirectHttpExtractor, Extractor, ExtractorChain, MediaInfo, YtDlpExtractor,
};
use crate::downloader::processor::{AudioTarget, FfmpegProcessor, PostProcessor};
use crate::downloader::runner::{JobRunner, RunnerSettings};
use crate::downloader::slot_pool::TaskSlotPool;
use crate::downloader::storage::JobStorage;
use crate::downloader::store::JobStore;
use crate::downloader::task::{validate_url, DownloadJob, DownloadOptions, JobStatus};
use anyhow::{Context, Result};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 可供下载的产物
#[derive(Debug)]
pub struct Artifact {
    pub file: tokio::fs::File,
    /// 产物文件名
    pub file_name: String,
    /// 文件大小，与任务记录的 total_bytes 一致
    pub size: u64,
}

/// 下载管理器
///
/// 所有字段都是共享句柄，clone 后指向同一组任务
#[derive(Clone)]
pub struct DownloadManager {
    /// 所有任务
    store: Arc<JobStore>,
    /// 任务执行器
    runner: Arc<JobRunner>,
    /// 任务位池，槽位数即最大同时下载数
    task_slot_pool: Arc<TaskSlotPool>,
    /// 等待队列（job_id 列表，FIFO）
    waiting_queue: Arc<Mutex<VecDeque<String>>>,
    /// 任务取消令牌（job_id -> CancellationToken）
    cancellation_tokens: Arc<RwLock<HashMap<String, CancellationToken>>>,
    /// 任务结束通知，触发等待队列调度
    completion_tx: mpsc::UnboundedSender<String>,
    /// 保留策略
    retention: RetentionConfig,
    /// info 接口超时
    probe_timeout: Duration,
    /// 关闭信号，所有任务令牌都是它的子令牌
    shutdown: CancellationToken,
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("jobs", &self.store.len())
            .field("max_slots", &self.task_slot_pool.max_slots())
            .finish_non_exhaustive()
    }
}

impl DownloadManager {
    /// 根据配置创建下载管理器，装配真实的解析器和后处理器
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.extractor.user_agent.clone())
            .connect_timeout(Duration::from_secs(15))
            .build()
            .context("创建 HTTP 客户端失败")?;
        let probe_timeout = Duration::from_secs(config.extractor.probe_timeout_secs);

        let mut backends: Vec<Arc<dyn Extractor>> = Vec::new();
        for name in &config.extractor.backends {
            match name.as_str() {
                "ytdlp" => backends.push(Arc::new(YtDlpExtractor::new(
                    config.extractor.ytdlp_path.clone(),
                    client.clone(),
                    probe_timeout,
                    config.extractor.user_agent.clone(),
                    config.extractor.max_formats,
                ))),
                "direct" => backends.push(Arc::new(DirectHttpExtractor::new(
                    client.clone(),
                    probe_timeout,
                ))),
                other => anyhow::bail!("未知的解析后端: {}", other),
            }
        }
        info!("解析后端顺序: {:?}", config.extractor.backends);

        let processor = FfmpegProcessor::new(
            config.processing.ffmpeg_path.clone(),
            Duration::from_secs(config.processing.timeout_secs),
        );

        Self::with_backends(
            config,
            Arc::new(ExtractorChain::new(backends)),
            Arc::new(processor),
        )
    }

    /// 使用指定的解析器和后处理器创建下载管理器
    pub fn with_backends(
        config: &AppConfig,
        extractor: Arc<dyn Extractor>,
        processor: Arc<dyn PostProcessor>,
    ) -> Result<Self> {
        let download_dir = &config.download.download_dir;
        if !download_dir.exists() {
            std::fs::create_dir_all(download_dir).context("创建下载目录失败")?;
            info!("✓ 下载目录已创建: {:?}", download_dir);
        }

        let settings = RunnerSettings {
            progress_interval: Duration::from_millis(config.download.progress_interval_ms),
            read_timeout: Duration::from_secs(config.download.read_timeout_secs),
            write_buffer: config.download.chunk_buffer_kb.max(1) * 1024,
            audio: config.processing.extract_audio.then(|| {
                AudioTarget::from_codec(
                    &config.processing.audio_codec,
                    &config.processing.audio_bitrate,
                )
            }),
        };

        let store = Arc::new(JobStore::new());
        let runner = JobRunner::new(
            store.clone(),
            JobStorage::new(download_dir.clone()),
            extractor,
            processor,
            settings,
        );

        info!(
            "创建下载管理器: 下载目录={:?}, 最大同时下载数={}",
            download_dir, config.download.max_concurrent_jobs
        );

        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let manager = Self {
            store,
            runner: Arc::new(runner),
            task_slot_pool: Arc::new(TaskSlotPool::new(config.download.max_concurrent_jobs)),
            waiting_queue: Arc::new(Mutex::new(VecDeque::new())),
            cancellation_tokens: Arc::new(RwLock::new(HashMap::new())),
            completion_tx,
            retention: config.retention.clone(),
            probe_timeout: Duration::from_secs(config.extractor.probe_timeout_secs),
            shutdown: CancellationToken::new(),
        };

        // 任务结束后立即调度等待队列
        manager.setup_waiting_queue_trigger(completion_rx);

        Ok(manager)
    }

    fn setup_waiting_queue_trigger(&self, mut rx: mpsc::UnboundedReceiver<String>) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = manager.shutdown.cancelled() => break,
                    finished = rx.recv() => match finished {
                        Some(job_id) => {
                            debug!("任务 {} 已结束，检查等待队列", job_id);
                            manager.try_start_waiting_tasks().await;
                        }
                        None => break,
                    },
                }
            }
            debug!("等待队列调度循环已退出");
        });
    }

    /// 提交下载任务
    ///
    /// 校验通过后创建 queued 记录并进入等待队列，立即返回任务ID；
    /// 校验失败时不创建任何记录
    pub async fn submit(&self, url: &str, options: DownloadOptions) -> DownloadResult<String> {
        if self.shutdown.is_cancelled() {
            return Err(DownloadError::Validation("服务正在关闭".to_string()));
        }
        let url = url.trim();
        validate_url(url)?;

        // 持有队列锁创建记录并入队，取消操作不会看到不在队列中的 queued 任务
        let job_id = {
            let mut queue = self.waiting_queue.lock().await;
            let job_id = self.store.create(url.to_string(), options);
            queue.push_back(job_id.clone());
            info!("提交下载任务: {} ({}), 等待队列长度: {}", job_id, url, queue.len());
            job_id
        };

        self.try_start_waiting_tasks().await;
        Ok(job_id)
    }

    /// 尝试从等待队列启动任务
    ///
    /// 持有队列锁完成"分配槽位 -> 出队 -> 注册令牌"，
    /// 取消操作不会看到既不在队列也没有令牌的任务
    pub(crate) async fn try_start_waiting_tasks(&self) {
        let mut queue = self.waiting_queue.lock().await;

        while let Some(job_id) = queue.front().cloned() {
            if self.shutdown.is_cancelled() {
                break;
            }

            let Some(slot_id) = self.task_slot_pool.allocate(&job_id).await else {
                debug!("无可用任务位，等待队列长度: {}", queue.len());
                break;
            };
            queue.pop_front();

            let token = self.shutdown.child_token();
            self.cancellation_tokens
                .write()
                .await
                .insert(job_id.clone(), token.clone());

            info!("⚡ 启动任务: {} (slot_id={})", job_id, slot_id);
            self.spawn_job(job_id, token);
        }
    }

    fn spawn_job(&self, job_id: String, token: CancellationToken) {
        let runner = self.runner.clone();
        let cancellation_tokens = self.cancellation_tokens.clone();
        let task_slot_pool = self.task_slot_pool.clone();
        let completion_tx = self.completion_tx.clone();

        tokio::spawn(async move {
            let status = runner.run(&job_id, token).await;
            debug!("任务 {} 结束: {}", job_id, status.as_str());

            cancellation_tokens.write().await.remove(&job_id);
            task_slot_pool.release(&job_id).await;

            if completion_tx.send(job_id).is_err() {
                debug!("调度循环已关闭，不再触发等待队列");
            }
        });
    }

    /// 查询任务状态
    pub fn status(&self, job_id: &str) -> DownloadResult<DownloadJob> {
        self.store.get(job_id)
    }

    /// 所有任务，按创建时间排序
    pub fn list(&self) -> Vec<DownloadJob> {
        self.store.list()
    }

    /// 获取视频信息，不创建任务
    pub async fn info(&self, url: &str) -> DownloadResult<MediaInfo> {
        let url = url.trim();
        validate_url(url)?;

        let extractor = self.runner.extractor();
        let info = tokio::time::timeout(self.probe_timeout, extractor.probe(url))
            .await
            .map_err(|_| DownloadError::Timeout {
                phase: TimeoutPhase::Extract,
                secs: self.probe_timeout.as_secs(),
            })??;
        Ok(info)
    }

    /// 取消任务
    ///
    /// - 排队中：移出队列，立即 cancelled
    /// - 运行中：触发取消令牌，运行器在下一个检查点进入 cancelled
    /// - 已是终态：不做任何修改
    pub async fn cancel(&self, job_id: &str) -> DownloadResult<DownloadJob> {
        let job = self.store.get(job_id)?;
        if job.status.is_terminal() {
            debug!("任务 {} 已处于终态 {}，忽略取消", job_id, job.status.as_str());
            return Ok(job);
        }

        {
            let mut queue = self.waiting_queue.lock().await;
            if let Some(pos) = queue.iter().position(|id| id == job_id) {
                queue.remove(pos);
                drop(queue);
                info!("取消排队中的任务: {}", job_id);
                return self.store.update(job_id, |j| j.mark_cancelled());
            }

            if let Some(token) = self.cancellation_tokens.read().await.get(job_id) {
                info!("取消运行中的任务: {}", job_id);
                token.cancel();
            }
        }

        self.store.update(job_id, |j| {
            if !j.status.is_terminal() {
                j.cancel_requested = true;
            }
        })
    }

    /// 取走已完成任务的产物
    pub async fn fetch(&self, job_id: &str) -> DownloadResult<Artifact> {
        let job = self.store.get(job_id)?;
        if job.status != JobStatus::Finished {
            return Err(DownloadError::NotReady(job.status.as_str().to_string()));
        }

        let path = PathBuf::from(&job.output_path);
        let file = tokio::fs::File::open(&path).await.map_err(|e| {
            warn!("任务 {} 的产物文件无法打开: {:?}, 错误: {}", job_id, path, e);
            DownloadError::NotFound(format!("{} 的产物文件", job_id))
        })?;
        let size = file.metadata().await?.len();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.bin", job_id));

        if job.retrieved_at.is_none() {
            let now = chrono::Utc::now().timestamp();
            self.store.update(job_id, |j| j.retrieved_at = Some(now))?;
        }

        Ok(Artifact {
            file,
            file_name,
            size,
        })
    }

    /// 动态更新最大并发任务数
    ///
    /// - 调大：立即从等待队列启动任务
    /// - 调小：正在运行的任务继续到完成，新任务排队
    pub async fn update_max_concurrent_jobs(&self, new_max: usize) {
        let new_max = new_max.max(1);
        self.task_slot_pool.resize(new_max).await;
        info!(
            "最大并发数调整为 {}，运行中: {}，排队中: {}",
            new_max,
            self.active_count().await,
            self.queued_count().await
        );
        self.try_start_waiting_tasks().await;
    }

    /// 正在运行的任务数
    pub async fn active_count(&self) -> usize {
        self.task_slot_pool.used_slots().await
    }

    /// 排队中的任务数
    pub async fn queued_count(&self) -> usize {
        self.waiting_queue.lock().await.len()
    }

    /// 清理过期的终态任务，返回删除数量
    pub async fn sweep_expired(&self, now: i64) -> usize {
        let policy = &self.retention;
        let ttl = |secs: u64| i64::try_from(secs).unwrap_or(i64::MAX);

        let mut terminal: Vec<DownloadJob> = self
            .store
            .list()
            .into_iter()
            .filter(|j| j.status.is_terminal())
            .collect();

        let mut expired: Vec<String> = Vec::new();
        terminal.retain(|job| {
            let completed = job.completed_at.unwrap_or(job.created_at);
            let deadline = match (job.status, job.retrieved_at) {
                (JobStatus::Finished, Some(retrieved)) => {
                    retrieved.saturating_add(ttl(policy.finished_ttl_secs))
                }
                (JobStatus::Finished, None) => {
                    completed.saturating_add(ttl(policy.unretrieved_ttl_secs))
                }
                _ => completed.saturating_add(ttl(policy.failed_ttl_secs)),
            };
            if now >= deadline {
                expired.push(job.id.clone());
                false
            } else {
                true
            }
        });

        // 超出上限时从最早完成的开始删除，产物未被取走的任务只按 TTL 过期
        if terminal.len() > policy.max_records {
            let excess = terminal.len() - policy.max_records;
            let mut evictable: Vec<&DownloadJob> = terminal
                .iter()
                .filter(|j| j.status != JobStatus::Finished || j.retrieved_at.is_some())
                .collect();
            evictable.sort_by_key(|j| j.completed_at.unwrap_or(j.created_at));
            if evictable.len() < excess {
                debug!(
                    "终态任务数超出上限 {}，其余 {} 个产物尚未取走",
                    policy.max_records,
                    excess - evictable.len()
                );
            }
            expired.extend(evictable.iter().take(excess).map(|j| j.id.clone()));
        }

        for job_id in &expired {
            if self.store.delete(job_id).is_ok() {
                self.runner.storage().discard(job_id).await;
            }
        }

        if !expired.is_empty() {
            info!("已清理 {} 个过期任务", expired.len());
        }
        expired.len()
    }

    /// 启动过期任务清理循环
    pub fn start_retention_sweeper(&self) {
        let interval_secs = self.retention.sweep_interval_secs;
        if interval_secs == 0 {
            info!("任务清理已禁用");
            return;
        }

        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = manager.shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        manager.sweep_expired(chrono::Utc::now().timestamp()).await;
                    }
                }
            }
        });
    }

    /// 关闭管理器：排队任务标记为取消，运行中的任务收到取消信号
    pub async fn shutdown(&self) {
        info!("正在关闭下载管理器");
        self.shutdown.cancel();

        let queued: Vec<String> = self.waiting_queue.lock().await.drain(..).collect();
        for job_id in queued {
            if let Err(e) = self.store.update(&job_id, |j| j.mark_cancelled()) {
                error!("关闭时取消排队任务 {} 失败: {}", job_id, e);
            }
        }

        // 等待运行中的任务写入终态，最多 5 秒
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.active_count().await > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!("仍有任务未结束，放弃等待");
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::testing::{CopyProcessor, FakeExtractor};
    use crate::downloader::task::{DownloadType, OutputFormat};
    use tempfile::TempDir;
    use tokio::sync::Semaphore;

    const URL: &str = "https://example.com/watch?v=1";

    fn config(temp: &TempDir, max_jobs: usize) -> AppConfig {
        let mut config = AppConfig::default();
        config.download.download_dir = temp.path().join("downloads");
        config.download.max_concurrent_jobs = max_jobs;
        config.download.progress_interval_ms = 10;
        config.download.read_timeout_secs = 5;
        config.retention.sweep_interval_secs = 0;
        config
    }

    fn manager(temp: &TempDir, max_jobs: usize, extractor: FakeExtractor) -> DownloadManager {
        DownloadManager::with_backends(
            &config(temp, max_jobs),
            Arc::new(extractor),
            Arc::new(CopyProcessor),
        )
        .unwrap()
    }

    async fn wait_for_status(manager: &DownloadManager, id: &str, status: JobStatus) -> DownloadJob {
        for _ in 0..500 {
            let job = manager.status(id).unwrap();
            if job.status == status {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("任务 {} 未进入状态 {}", id, status.as_str());
    }

    #[tokio::test]
    async fn test_submit_runs_to_finished() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp, 2, FakeExtractor::new(vec![vec![1u8; 256]; 4]));

        let id = manager.submit(URL, DownloadOptions::default()).await.unwrap();
        let job = wait_for_status(&manager, &id, JobStatus::Finished).await;

        assert_eq!(job.progress, 100.0);
        assert_eq!(job.total_bytes, 1024);
        assert!(!job.output_path.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_request_creates_nothing() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp, 2, FakeExtractor::new(vec![]));

        let err = manager.submit("not a url", DownloadOptions::default()).await;
        assert!(matches!(err, Err(DownloadError::Validation(_))));
        assert!(manager.list().is_empty());
    }

    #[tokio::test]
    async fn test_concurrency_limit_and_fifo() {
        let temp = TempDir::new().unwrap();
        let gate = Arc::new(Semaphore::new(0));
        let extractor = FakeExtractor::new(vec![vec![0u8; 16]]).with_gate(gate.clone());
        let manager = manager(&temp, 2, extractor);

        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(manager.submit(URL, DownloadOptions::default()).await.unwrap());
        }

        wait_for_status(&manager, &ids[0], JobStatus::Downloading).await;
        wait_for_status(&manager, &ids[1], JobStatus::Downloading).await;
        assert_eq!(manager.status(&ids[2]).unwrap().status, JobStatus::Queued);
        assert_eq!(manager.status(&ids[3]).unwrap().status, JobStatus::Queued);
        assert_eq!(manager.active_count().await, 2);
        assert_eq!(manager.queued_count().await, 2);

        // 放行一个任务，队首的任务接替
        gate.add_permits(1);
        let finished = [&ids[0], &ids[1]];
        for _ in 0..500 {
            let done = finished
                .iter()
                .filter(|id| manager.status(id).unwrap().status == JobStatus::Finished)
                .count();
            if done == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        wait_for_status(&manager, &ids[2], JobStatus::Downloading).await;
        assert_eq!(manager.status(&ids[3]).unwrap().status, JobStatus::Queued);

        let running = manager
            .list()
            .iter()
            .filter(|j| j.status == JobStatus::Downloading)
            .count();
        assert!(running <= 2);

        gate.add_permits(3);
        for id in &ids {
            wait_for_status(&manager, id, JobStatus::Finished).await;
        }
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        let temp = TempDir::new().unwrap();
        let gate = Arc::new(Semaphore::new(0));
        let extractor = FakeExtractor::new(vec![vec![0u8; 16]]).with_gate(gate.clone());
        let manager = manager(&temp, 1, extractor);

        let first = manager.submit(URL, DownloadOptions::default()).await.unwrap();
        let second = manager.submit(URL, DownloadOptions::default()).await.unwrap();

        let job = manager.cancel(&second).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(manager.queued_count().await, 0);

        gate.add_permits(1);
        wait_for_status(&manager, &first, JobStatus::Finished).await;
        assert_eq!(manager.status(&second).unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_running_job() {
        let temp = TempDir::new().unwrap();
        let extractor = FakeExtractor::new(vec![vec![0u8; 16]; 1000])
            .with_delay(Duration::from_millis(20));
        let manager = manager(&temp, 1, extractor);

        let id = manager.submit(URL, DownloadOptions::default()).await.unwrap();
        wait_for_status(&manager, &id, JobStatus::Downloading).await;

        manager.cancel(&id).await.unwrap();
        let job = wait_for_status(&manager, &id, JobStatus::Cancelled).await;
        assert!(job.output_path.is_empty());

        // 终态任务再次取消不产生变化
        let again = manager.cancel(&id).await.unwrap();
        assert_eq!(again.status, JobStatus::Cancelled);
        assert!(matches!(
            manager.cancel("missing").await,
            Err(DownloadError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_states() {
        let temp = TempDir::new().unwrap();
        let gate = Arc::new(Semaphore::new(0));
        let extractor = FakeExtractor::new(vec![vec![9u8; 300]]).with_gate(gate.clone());
        let manager = manager(&temp, 1, extractor);

        assert!(matches!(manager.fetch("missing").await, Err(DownloadError::NotFound(_))));

        let id = manager.submit(URL, DownloadOptions::default()).await.unwrap();
        assert!(matches!(manager.fetch(&id).await, Err(DownloadError::NotReady(_))));

        gate.add_permits(1);
        let job = wait_for_status(&manager, &id, JobStatus::Finished).await;

        let artifact = manager.fetch(&id).await.unwrap();
        assert_eq!(artifact.size, job.total_bytes);
        assert_eq!(artifact.file_name, "Fake Video_Tester.mp4");
        assert!(manager.status(&id).unwrap().retrieved_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_job_does_not_block_queue() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp, 1, FakeExtractor::failing("源站错误"));

        let a = manager.submit(URL, DownloadOptions::default()).await.unwrap();
        let b = manager.submit(URL, DownloadOptions::default()).await.unwrap();

        let job = wait_for_status(&manager, &a, JobStatus::Error).await;
        assert!(job.error.contains("源站错误"));
        wait_for_status(&manager, &b, JobStatus::Error).await;
        assert_eq!(manager.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_info_lookup() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp, 1, FakeExtractor::new(vec![vec![0u8; 10]]));

        let info = manager.info(URL).await.unwrap();
        assert_eq!(info.title, "Fake Video");
        assert_eq!(info.formats.len(), 1);
        assert!(manager.list().is_empty());

        assert!(matches!(manager.info("").await, Err(DownloadError::Validation(_))));
    }

    #[tokio::test]
    async fn test_sweep_expired_removes_record_and_files() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp, 1, FakeExtractor::new(vec![vec![0u8; 10]]));

        let options = DownloadOptions::new(DownloadType::Video, OutputFormat::Best, None, None).unwrap();
        let id = manager.submit(URL, options).await.unwrap();
        let job = wait_for_status(&manager, &id, JobStatus::Finished).await;
        let completed = job.completed_at.unwrap();

        assert_eq!(manager.sweep_expired(completed).await, 0);
        assert!(std::path::Path::new(&job.output_path).exists());

        let later = completed + 24 * 3600;
        assert_eq!(manager.sweep_expired(later).await, 1);
        assert!(matches!(manager.status(&id), Err(DownloadError::NotFound(_))));
        assert!(!std::path::Path::new(&job.output_path).exists());
    }

    #[tokio::test]
    async fn test_capacity_sweep_keeps_unretrieved_artifacts() {
        let temp = TempDir::new().unwrap();
        let mut config = config(&temp, 2);
        config.retention.max_records = 1;
        let manager = DownloadManager::with_backends(
            &config,
            Arc::new(FakeExtractor::new(vec![vec![0u8; 10]])),
            Arc::new(CopyProcessor),
        )
        .unwrap();

        let a = manager.submit(URL, DownloadOptions::default()).await.unwrap();
        let b = manager.submit(URL, DownloadOptions::default()).await.unwrap();
        let job_a = wait_for_status(&manager, &a, JobStatus::Finished).await;
        let job_b = wait_for_status(&manager, &b, JobStatus::Finished).await;
        let now = job_a.completed_at.max(job_b.completed_at).unwrap();

        // 两个产物都未取走，超出上限也不删除
        assert_eq!(manager.sweep_expired(now).await, 0);
        assert!(std::path::Path::new(&job_a.output_path).exists());
        assert!(std::path::Path::new(&job_b.output_path).exists());

        // 取走后的任务优先被删除
        manager.fetch(&a).await.unwrap();
        assert_eq!(manager.sweep_expired(now).await, 1);
        assert!(matches!(manager.status(&a), Err(DownloadError::NotFound(_))));
        assert_eq!(manager.status(&b).unwrap().status, JobStatus::Finished);
        assert!(std::path::Path::new(&job_b.output_path).exists());
    }

    #[tokio::test]
    async fn test_capacity_sweep_prefers_failed_jobs() {
        let temp = TempDir::new().unwrap();
        let mut config = config(&temp, 1);
        config.retention.max_records = 1;
        let manager = DownloadManager::with_backends(
            &config,
            Arc::new(FakeExtractor::failing("源站错误")),
            Arc::new(CopyProcessor),
        )
        .unwrap();

        let a = manager.submit(URL, DownloadOptions::default()).await.unwrap();
        let b = manager.submit(URL, DownloadOptions::default()).await.unwrap();
        wait_for_status(&manager, &a, JobStatus::Error).await;
        let job_b = wait_for_status(&manager, &b, JobStatus::Error).await;

        assert_eq!(manager.sweep_expired(job_b.completed_at.unwrap()).await, 1);
        assert_eq!(manager.list().len(), 1);
    }

    #[tokio::test]
    async fn test_raise_concurrency_starts_queued_jobs() {
        let temp = TempDir::new().unwrap();
        let gate = Arc::new(Semaphore::new(0));
        let extractor = FakeExtractor::new(vec![vec![0u8; 16]]).with_gate(gate.clone());
        let manager = manager(&temp, 1, extractor);

        let a = manager.submit(URL, DownloadOptions::default()).await.unwrap();
        let b = manager.submit(URL, DownloadOptions::default()).await.unwrap();
        wait_for_status(&manager, &a, JobStatus::Downloading).await;
        assert_eq!(manager.status(&b).unwrap().status, JobStatus::Queued);

        manager.update_max_concurrent_jobs(2).await;
        wait_for_status(&manager, &b, JobStatus::Downloading).await;

        gate.add_permits(2);
        wait_for_status(&manager, &a, JobStatus::Finished).await;
        wait_for_status(&manager, &b, JobStatus::Finished).await;
    }

    #[tokio::test]
    async fn test_shutdown_cancels_queued_and_running() {
        let temp = TempDir::new().unwrap();
        let gate = Arc::new(Semaphore::new(0));
        let extractor = FakeExtractor::new(vec![vec![0u8; 16]]).with_gate(gate);
        let manager = manager(&temp, 1, extractor);

        let a = manager.submit(URL, DownloadOptions::default()).await.unwrap();
        let b = manager.submit(URL, DownloadOptions::default()).await.unwrap();
        wait_for_status(&manager, &a, JobStatus::Downloading).await;

        manager.shutdown().await;
        assert_eq!(manager.status(&a).unwrap().status, JobStatus::Cancelled);
        assert_eq!(manager.status(&b).unwrap().status, JobStatus::Cancelled);
        assert!(manager.submit(URL, DownloadOptions::default()).await.is_err());
    }
}
