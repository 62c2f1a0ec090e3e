// 应用状态

use crate::config::AppConfig;
use crate::downloader::DownloadManager;
use std::sync::Arc;

/// 应用全局状态
#[derive(Clone, Debug)]
pub struct AppState {
    /// 下载管理器
    pub download_manager: Arc<DownloadManager>,
}

impl AppState {
    /// 按配置创建应用状态，并启动过期任务清理
    pub fn new(config: &AppConfig) -> anyhow::Result<Self> {
        let manager = DownloadManager::from_config(config)?;
        manager.start_retention_sweeper();
        Ok(Self::with_manager(manager))
    }

    /// 使用已装配的下载管理器
    pub fn with_manager(manager: DownloadManager) -> Self {
        Self {
            download_manager: Arc::new(manager),
        }
    }

    /// 优雅关闭
    pub async fn shutdown(&self) {
        self.download_manager.shutdown().await;
    }
}
