use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;
use uuid::Uuid;

use super::error::DownloadError;

/// 校验视频地址格式
///
/// 接受 http/https，主机为域名、localhost 或 IPv4，可带端口和路径
pub fn validate_url(url: &str) -> Result<(), DownloadError> {
    static URL_PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = URL_PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)^https?://(?:(?:[A-Z0-9](?:[A-Z0-9-]{0,61}[A-Z0-9])?\.)+[A-Z]{2,6}\.?|localhost|\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})(?::\d+)?(?:/?|[/?]\S+)$",
        )
        .expect("URL 正则表达式无效")
    });

    let url = url.trim();
    if url.is_empty() {
        return Err(DownloadError::Validation("URL 不能为空".to_string()));
    }
    if !pattern.is_match(url) {
        return Err(DownloadError::Validation(format!("URL 格式无效: {}", url)));
    }
    Ok(())
}

/// 下载任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// 排队中（等待任务位）
    Queued,
    /// 下载中
    Downloading,
    /// 后处理中（裁剪、音频提取）
    Processing,
    /// 已完成
    Finished,
    /// 失败
    Error,
    /// 已取消
    Cancelled,
}

impl JobStatus {
    /// 是否为终态
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Error | JobStatus::Cancelled
        )
    }

    /// 状态机是否允许 self -> next
    ///
    /// 相同状态视为合法（用于只更新进度字段）
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        if self == next {
            return true;
        }
        match self {
            Queued => matches!(next, Downloading | Error | Cancelled),
            Downloading => matches!(next, Processing | Finished | Error | Cancelled),
            Processing => matches!(next, Finished | Error | Cancelled),
            Finished | Error | Cancelled => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Downloading => "downloading",
            JobStatus::Processing => "processing",
            JobStatus::Finished => "finished",
            JobStatus::Error => "error",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

/// 下载类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DownloadType {
    /// 视频（音视频合一的流）
    #[default]
    Video,
    /// 仅音频
    Audio,
    /// 完整质量（不限容器的最高画质）
    Full,
}

impl DownloadType {
    pub fn parse(value: &str) -> Result<Self, DownloadError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "video" => Ok(DownloadType::Video),
            "audio" => Ok(DownloadType::Audio),
            "full" => Ok(DownloadType::Full),
            other => Err(DownloadError::Validation(format!(
                "不支持的下载类型: {}（可选 video / audio / full）",
                other
            ))),
        }
    }
}

/// 输出格式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// 最佳质量，不限容器
    #[default]
    Best,
    Mp4,
    Webm,
}

impl OutputFormat {
    pub fn parse(value: &str) -> Result<Self, DownloadError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "best" => Ok(OutputFormat::Best),
            "mp4" => Ok(OutputFormat::Mp4),
            "webm" => Ok(OutputFormat::Webm),
            other => Err(DownloadError::Validation(format!(
                "不支持的格式: {}（可选 best / mp4 / webm）",
                other
            ))),
        }
    }

    /// 期望的文件扩展名，Best 不限制
    pub fn preferred_ext(self) -> Option<&'static str> {
        match self {
            OutputFormat::Best => None,
            OutputFormat::Mp4 => Some("mp4"),
            OutputFormat::Webm => Some("webm"),
        }
    }
}

/// 下载选项（已校验）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadOptions {
    pub download_type: DownloadType,
    pub format: OutputFormat,
    /// 裁剪起点（秒）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<u64>,
    /// 裁剪终点（秒）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
}

impl DownloadOptions {
    /// 校验并构造下载选项
    ///
    /// 同时给出起止时间时要求 end_time > start_time
    pub fn new(
        download_type: DownloadType,
        format: OutputFormat,
        start_time: Option<u64>,
        end_time: Option<u64>,
    ) -> Result<Self, DownloadError> {
        if let (Some(start), Some(end)) = (start_time, end_time) {
            if end <= start {
                return Err(DownloadError::Validation(format!(
                    "结束时间必须大于开始时间: start_time={}, end_time={}",
                    start, end
                )));
            }
        }
        Ok(Self {
            download_type,
            format,
            start_time,
            end_time,
        })
    }

    /// 是否请求了时间范围裁剪
    pub fn wants_trim(&self) -> bool {
        self.start_time.is_some() || self.end_time.is_some()
    }
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            download_type: DownloadType::Video,
            format: OutputFormat::Best,
            start_time: None,
            end_time: None,
        }
    }
}

/// 下载任务记录
///
/// 由 [`JobStore`](super::JobStore) 独占持有，运行器只通过 store 的原子更新发布进度
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadJob {
    /// 任务ID
    pub id: String,
    /// 源地址
    pub url: String,
    /// 下载选项
    pub options: DownloadOptions,
    /// 任务状态
    pub status: JobStatus,
    /// 进度百分比 (0-100)
    pub progress: f64,
    /// 下载速度 (bytes/s)
    pub speed: u64,
    /// 剩余时间估算 (秒)
    pub eta: u64,
    /// 已下载大小
    pub downloaded_bytes: u64,
    /// 文件大小，未知时为 0
    pub total_bytes: u64,
    /// 错误信息，仅 error 状态非空
    pub error: String,
    /// 媒体标题
    pub title: String,
    /// 产物路径，仅 finished 状态非空
    pub output_path: String,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 开始时间 (Unix timestamp)
    pub started_at: Option<i64>,
    /// 完成时间（任何终态）
    pub completed_at: Option<i64>,

    /// 已请求取消
    #[serde(skip)]
    pub cancel_requested: bool,
    /// 产物首次被取走的时间，用于过期清理
    #[serde(skip)]
    pub retrieved_at: Option<i64>,
}

impl DownloadJob {
    pub fn new(url: String, options: DownloadOptions) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            url,
            options,
            status: JobStatus::Queued,
            progress: 0.0,
            speed: 0,
            eta: 0,
            downloaded_bytes: 0,
            total_bytes: 0,
            error: String::new(),
            title: String::new(),
            output_path: String::new(),
            created_at: chrono::Utc::now().timestamp(),
            started_at: None,
            completed_at: None,
            cancel_requested: false,
            retrieved_at: None,
        }
    }

    /// 根据字节数计算进度百分比
    pub fn compute_progress(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        let ratio = self.downloaded_bytes as f64 / self.total_bytes as f64;
        (ratio * 100.0).clamp(0.0, 100.0)
    }

    /// 估算剩余时间 (秒)
    pub fn compute_eta(&self) -> u64 {
        if self.speed == 0 || self.downloaded_bytes >= self.total_bytes {
            return 0;
        }
        (self.total_bytes - self.downloaded_bytes) / self.speed
    }

    /// 一次性写入传输进度及其派生字段
    pub fn apply_transfer(&mut self, downloaded: u64, total: Option<u64>, speed: u64) {
        self.downloaded_bytes = downloaded;
        if let Some(total) = total {
            self.total_bytes = total;
        }
        self.speed = speed;
        self.eta = self.compute_eta();
        self.progress = self.compute_progress();
    }

    /// 标记为下载中
    pub fn mark_downloading(&mut self) {
        self.status = JobStatus::Downloading;
        if self.started_at.is_none() {
            self.started_at = Some(chrono::Utc::now().timestamp());
        }
    }

    /// 标记为后处理中
    pub fn mark_processing(&mut self) {
        self.status = JobStatus::Processing;
        self.speed = 0;
        self.eta = 0;
    }

    /// 标记为已完成
    pub fn mark_finished(&mut self, output_path: PathBuf) {
        self.status = JobStatus::Finished;
        self.output_path = output_path.to_string_lossy().into_owned();
        self.progress = 100.0;
        self.speed = 0;
        self.eta = 0;
        if self.total_bytes == 0 {
            self.total_bytes = self.downloaded_bytes;
        }
        self.completed_at = Some(chrono::Utc::now().timestamp());
    }

    /// 标记为失败
    pub fn mark_error(&mut self, error: String) {
        self.status = JobStatus::Error;
        self.error = error;
        self.speed = 0;
        self.eta = 0;
        self.completed_at = Some(chrono::Utc::now().timestamp());
    }

    /// 标记为已取消
    pub fn mark_cancelled(&mut self) {
        self.status = JobStatus::Cancelled;
        self.cancel_requested = true;
        self.speed = 0;
        self.eta = 0;
        self.completed_at = Some(chrono::Utc::now().timestamp());
    }
}
