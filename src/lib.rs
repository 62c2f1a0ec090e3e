// VidVault
// 视频下载任务编排服务核心库

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 下载引擎模块
pub mod downloader;

// Web服务器模块
pub mod server;

// 导出常用类型
pub use config::AppConfig;
pub use downloader::{DownloadJob, DownloadManager, DownloadOptions, JobStatus};
pub use server::{build_router, AppState};
