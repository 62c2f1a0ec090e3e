//! 下载编排错误类型

use thiserror::Error;

/// 超时发生的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    Extract,
    Transfer,
    Processing,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TimeoutPhase::Extract => "解析视频信息",
            TimeoutPhase::Transfer => "传输数据",
            TimeoutPhase::Processing => "后处理",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum DownloadError {
    /// 参数错误，提交阶段拒绝，不会创建任务
    #[error("参数错误: {0}")]
    Validation(String),

    /// 源站不支持或无法访问
    #[error("无法获取视频信息: {0}")]
    Extraction(String),

    #[error("下载数据失败: {0}")]
    Transfer(String),

    #[error("后处理失败: {0}")]
    Processing(String),

    #[error("{phase}超时（{secs} 秒）")]
    Timeout { phase: TimeoutPhase, secs: u64 },

    #[error("任务不存在: {0}")]
    NotFound(String),

    #[error("下载尚未完成，当前状态: {0}")]
    NotReady(String),

    /// 终态，不是失败
    #[error("任务已取消")]
    Cancelled,

    #[error("状态转换非法: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("文件读写失败: {0}")]
    Io(#[from] std::io::Error),
}

pub type DownloadResult<T> = Result<T, DownloadError>;
