use crate::downloader::{
    DownloadError, DownloadJob, DownloadOptions, DownloadType, JobStatus, MediaInfo, OutputFormat,
};
use crate::server::{ApiError, ApiResult, AppState};
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tracing::info;

/// 获取视频信息请求
#[derive(Debug, Deserialize)]
pub struct VideoInfoRequest {
    pub url: String,
}

/// 创建下载任务请求
#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    pub url: String,
    /// video / audio / full，默认 video
    #[serde(default)]
    pub download_type: Option<String>,
    /// best / mp4 / webm，默认 best
    #[serde(default)]
    pub format: Option<String>,
    /// 兼容旧客户端，不参与格式选择
    #[serde(default)]
    pub quality: Option<String>,
    /// 裁剪起点（秒）
    #[serde(default)]
    pub start_time: Option<i64>,
    /// 裁剪终点（秒）
    #[serde(default)]
    pub end_time: Option<i64>,
}

impl DownloadRequest {
    /// 校验并转换为下载选项
    fn to_options(&self) -> ApiResult<DownloadOptions> {
        let download_type = match self.download_type.as_deref() {
            None | Some("") => DownloadType::default(),
            Some(value) => DownloadType::parse(value)?,
        };
        let format = match self.format.as_deref() {
            None | Some("") => OutputFormat::default(),
            Some(value) => OutputFormat::parse(value)?,
        };
        let start_time = non_negative("start_time", self.start_time)?;
        let end_time = non_negative("end_time", self.end_time)?;
        Ok(DownloadOptions::new(download_type, format, start_time, end_time)?)
    }
}

fn non_negative(field: &str, value: Option<i64>) -> ApiResult<Option<u64>> {
    match value {
        Some(v) if v < 0 => Err(ApiError::bad_request(format!(
            "参数错误: {} 不能为负数: {}",
            field, v
        ))),
        Some(v) => Ok(Some(v as u64)),
        None => Ok(None),
    }
}

/// 创建下载任务响应
#[derive(Debug, Serialize)]
pub struct DownloadStartedResponse {
    pub download_id: String,
    pub status: String,
    pub message: String,
}

/// 取消响应
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub status: String,
    pub message: String,
}

/// 任务状态（轮询接口返回体）
#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub download_id: String,
    pub url: String,
    pub status: JobStatus,
    pub progress: f64,
    pub speed: u64,
    pub eta: u64,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub error: String,
    pub title: String,
    pub output_path: String,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl From<DownloadJob> for JobStatusResponse {
    fn from(job: DownloadJob) -> Self {
        Self {
            download_id: job.id,
            url: job.url,
            status: job.status,
            progress: job.progress,
            speed: job.speed,
            eta: job.eta,
            downloaded_bytes: job.downloaded_bytes,
            total_bytes: job.total_bytes,
            error: job.error,
            title: job.title,
            output_path: job.output_path,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}

/// POST /api/video/info
/// 获取视频信息，不创建任务
pub async fn get_video_info(
    State(app_state): State<AppState>,
    payload: Result<Json<VideoInfoRequest>, JsonRejection>,
) -> ApiResult<Json<MediaInfo>> {
    let Json(req) = payload?;
    let info = app_state.download_manager.info(&req.url).await?;
    Ok(Json(info))
}

/// POST /api/video/download
/// 创建下载任务，立即返回任务ID
pub async fn start_download(
    State(app_state): State<AppState>,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> ApiResult<Json<DownloadStartedResponse>> {
    let Json(req) = payload?;
    let options = req.to_options()?;
    let download_id = app_state.download_manager.submit(&req.url, options).await?;

    info!("创建下载任务成功: {}", download_id);
    Ok(Json(DownloadStartedResponse {
        download_id,
        status: "started".to_string(),
        message: "下载已开始".to_string(),
    }))
}

/// GET /api/video/status/:id
pub async fn get_download_status(
    State(app_state): State<AppState>,
    Path(download_id): Path<String>,
) -> ApiResult<Json<JobStatusResponse>> {
    let job = app_state
        .download_manager
        .status(&download_id)
        .map_err(|_| ApiError::not_found("Download not found"))?;
    Ok(Json(job.into()))
}

/// GET /api/video/downloads
/// 获取所有下载记录
pub async fn get_all_downloads(
    State(app_state): State<AppState>,
) -> Json<Vec<JobStatusResponse>> {
    let jobs = app_state.download_manager.list();
    Json(jobs.into_iter().map(JobStatusResponse::from).collect())
}

/// POST /api/video/cancel/:id
///
/// 已结束的任务保持原状态，重复取消同样返回 200
pub async fn cancel_download(
    State(app_state): State<AppState>,
    Path(download_id): Path<String>,
) -> ApiResult<Json<CancelResponse>> {
    let job = app_state
        .download_manager
        .cancel(&download_id)
        .await
        .map_err(|e| match e {
            DownloadError::NotFound(_) => ApiError::not_found("Download not found"),
            other => ApiError::from(other),
        })?;

    Ok(Json(cancel_response(job.status)))
}

/// 按取消后任务的实际状态生成响应
fn cancel_response(status: JobStatus) -> CancelResponse {
    match status {
        JobStatus::Finished | JobStatus::Error => CancelResponse {
            status: status.as_str().to_string(),
            message: "任务已结束，无需取消".to_string(),
        },
        _ => CancelResponse {
            status: JobStatus::Cancelled.as_str().to_string(),
            message: "下载已取消".to_string(),
        },
    }
}

/// 生成 Content-Disposition，文件名按 UTF-8 百分号编码
fn content_disposition(file_name: &str) -> HeaderValue {
    let encoded = urlencoding::encode(file_name);
    let value = format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        encoded, encoded
    );
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

/// GET /api/video/download/:id
/// 流式返回产物文件
pub async fn download_file(
    State(app_state): State<AppState>,
    Path(download_id): Path<String>,
) -> ApiResult<Response> {
    let artifact = app_state.download_manager.fetch(&download_id).await?;
    info!(
        "发送产物文件: {} ({}, {} 字节)",
        download_id, artifact.file_name, artifact.size
    );

    let body = Body::from_stream(ReaderStream::new(artifact.file));
    let headers = [
        (
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        ),
        (
            header::CONTENT_LENGTH,
            HeaderValue::from(artifact.size),
        ),
        (
            header::CONTENT_DISPOSITION,
            content_disposition(&artifact.file_name),
        ),
    ];
    Ok((StatusCode::OK, headers, body).into_response())
}
