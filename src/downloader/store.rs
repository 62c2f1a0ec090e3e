//! 任务存储
//!
//! 任务ID -> 任务记录的并发映射，是状态查询的唯一数据源。
//! 每条记录单独加锁，轮询读取不会互相阻塞；一次 update 内的所有字段修改
//! 在同一个临界区完成，读者不会看到半更新的记录。

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::error::{DownloadError, DownloadResult};
use super::task::{DownloadJob, DownloadOptions, JobStatus};

/// 任务存储
#[derive(Debug, Default)]
pub struct JobStore {
    jobs: DashMap<String, Arc<RwLock<DownloadJob>>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self {
            jobs: DashMap::new(),
        }
    }

    /// 创建新任务记录（状态 queued），返回任务ID
    pub fn create(&self, url: String, options: DownloadOptions) -> String {
        let job = DownloadJob::new(url, options);
        let id = job.id.clone();
        self.jobs.insert(id.clone(), Arc::new(RwLock::new(job)));
        debug!("创建任务记录: {}", id);
        id
    }

    /// 获取任务快照
    pub fn get(&self, id: &str) -> DownloadResult<DownloadJob> {
        let entry = self
            .jobs
            .get(id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| DownloadError::NotFound(id.to_string()))?;
        let job = entry.read().clone();
        Ok(job)
    }

    /// 对任务记录执行一次原子修改，返回修改后的快照
    ///
    /// 修改在副本上执行，校验通过后整体写回：
    /// - 状态必须沿状态机前进，终态之后不再改变
    /// - 非终态下进度单调不减，终态后冻结
    /// - output_path 当且仅当 finished 时非空
    ///
    /// 校验失败时记录保持不变，返回 `InvalidTransition`
    pub fn update<F>(&self, id: &str, mutator: F) -> DownloadResult<DownloadJob>
    where
        F: FnOnce(&mut DownloadJob),
    {
        let entry = self
            .jobs
            .get(id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| DownloadError::NotFound(id.to_string()))?;

        let mut guard = entry.write();
        let before = guard.status;
        let mut next = guard.clone();
        mutator(&mut next);

        if !before.can_transition_to(next.status) {
            warn!(
                "任务 {} 拒绝非法状态转换: {} -> {}",
                id,
                before.as_str(),
                next.status.as_str()
            );
            return Err(DownloadError::InvalidTransition {
                from: before.as_str().to_string(),
                to: next.status.as_str().to_string(),
            });
        }

        if before.is_terminal() {
            // 终态只允许修改内部簿记字段
            next.progress = guard.progress;
            next.output_path = guard.output_path.clone();
            next.error = guard.error.clone();
        } else if next.progress < guard.progress {
            next.progress = guard.progress;
        }

        if next.status == JobStatus::Finished {
            next.progress = 100.0;
        } else {
            next.output_path.clear();
        }
        if next.status != JobStatus::Error {
            next.error.clear();
        }

        *guard = next;
        Ok(guard.clone())
    }

    /// 删除任务记录
    pub fn delete(&self, id: &str) -> DownloadResult<DownloadJob> {
        let (_, entry) = self
            .jobs
            .remove(id)
            .ok_or_else(|| DownloadError::NotFound(id.to_string()))?;
        let job = entry.read().clone();
        Ok(job)
    }

    /// 所有任务快照，按创建时间排序
    pub fn list(&self) -> Vec<DownloadJob> {
        let mut jobs: Vec<DownloadJob> = self
            .jobs
            .iter()
            .map(|e| e.value().read().clone())
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
