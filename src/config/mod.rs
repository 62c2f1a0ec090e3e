// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 可选的解析后端
pub const KNOWN_BACKENDS: &[&str] = &["ytdlp", "direct"];

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务器配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 解析器配置
    #[serde(default)]
    pub extractor: ExtractorConfig,
    /// 后处理配置
    #[serde(default)]
    pub processing: ProcessingConfig,
    /// 任务记录保留策略
    #[serde(default)]
    pub retention: RetentionConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    #[serde(default = "default_host")]
    pub host: String,
    /// 监听端口
    #[serde(default = "default_port")]
    pub port: u16,
    /// CORS允许的源，包含 "*" 时允许任意来源
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: default_cors_origins(),
        }
    }
}

/// 下载配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 产物存放目录，每个任务一个子目录
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// 最大同时下载数
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    /// 进度写入间隔（毫秒）
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// 单次读取超时（秒），超过视为连接卡死
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// 写文件缓冲区（KB）
    #[serde(default = "default_chunk_buffer_kb")]
    pub chunk_buffer_kb: usize,
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_max_concurrent_jobs() -> usize {
    3
}

fn default_progress_interval_ms() -> u64 {
    200
}

fn default_read_timeout_secs() -> u64 {
    30
}

fn default_chunk_buffer_kb() -> usize {
    256
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            progress_interval_ms: default_progress_interval_ms(),
            read_timeout_secs: default_read_timeout_secs(),
            chunk_buffer_kb: default_chunk_buffer_kb(),
        }
    }
}

/// 解析器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractorConfig {
    /// 后端尝试顺序，可选 ytdlp / direct
    #[serde(default = "default_backends")]
    pub backends: Vec<String>,
    /// yt-dlp 可执行文件
    #[serde(default = "default_ytdlp_path")]
    pub ytdlp_path: PathBuf,
    /// 解析超时（秒）
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// 访问源站时使用的 User-Agent
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// info 接口最多返回的格式数
    #[serde(default = "default_max_formats")]
    pub max_formats: usize,
}

fn default_backends() -> Vec<String> {
    vec!["ytdlp".to_string(), "direct".to_string()]
}

fn default_ytdlp_path() -> PathBuf {
    PathBuf::from("yt-dlp")
}

fn default_probe_timeout_secs() -> u64 {
    60
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string()
}

fn default_max_formats() -> usize {
    10
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            backends: default_backends(),
            ytdlp_path: default_ytdlp_path(),
            probe_timeout_secs: default_probe_timeout_secs(),
            user_agent: default_user_agent(),
            max_formats: default_max_formats(),
        }
    }
}

/// 后处理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// ffmpeg 可执行文件
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    /// 单次后处理超时（秒）
    #[serde(default = "default_processing_timeout_secs")]
    pub timeout_secs: u64,
    /// 音频任务是否转码
    #[serde(default = "default_extract_audio")]
    pub extract_audio: bool,
    /// 音频编码（mp3 / aac / opus）
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,
    /// 音频码率
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: String,
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_processing_timeout_secs() -> u64 {
    600
}

fn default_extract_audio() -> bool {
    true
}

fn default_audio_codec() -> String {
    "mp3".to_string()
}

fn default_audio_bitrate() -> String {
    "192k".to_string()
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            timeout_secs: default_processing_timeout_secs(),
            extract_audio: default_extract_audio(),
            audio_codec: default_audio_codec(),
            audio_bitrate: default_audio_bitrate(),
        }
    }
}

/// 任务记录保留策略
///
/// 过期的终态任务连同产物文件一起删除
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// 清理周期（秒），0 表示不启动清理
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// 产物被取走后保留时长（秒）
    #[serde(default = "default_finished_ttl_secs")]
    pub finished_ttl_secs: u64,
    /// 产物未被取走时保留时长（秒）
    #[serde(default = "default_unretrieved_ttl_secs")]
    pub unretrieved_ttl_secs: u64,
    /// 失败或取消的任务保留时长（秒）
    #[serde(default = "default_failed_ttl_secs")]
    pub failed_ttl_secs: u64,
    /// 最多保留的终态任务数，超出时从最早完成的开始删除
    #[serde(default = "default_max_records")]
    pub max_records: usize,
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_finished_ttl_secs() -> u64 {
    3600
}

fn default_unretrieved_ttl_secs() -> u64 {
    24 * 3600
}

fn default_failed_ttl_secs() -> u64 {
    3600
}

fn default_max_records() -> usize {
    1000
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            finished_ttl_secs: default_finished_ttl_secs(),
            unretrieved_ttl_secs: default_unretrieved_ttl_secs(),
            failed_ttl_secs: default_failed_ttl_secs(),
            max_records: default_max_records(),
        }
    }
}

impl AppConfig {
    /// 校验配置取值
    pub fn validate(&self) -> Result<()> {
        if self.download.download_dir.as_os_str().is_empty() {
            anyhow::bail!("download.download_dir 不能为空");
        }
        if self.download.max_concurrent_jobs == 0 {
            anyhow::bail!("download.max_concurrent_jobs 必须大于 0");
        }
        if self.download.progress_interval_ms == 0 {
            anyhow::bail!("download.progress_interval_ms 必须大于 0");
        }
        if self.download.read_timeout_secs == 0 {
            anyhow::bail!("download.read_timeout_secs 必须大于 0");
        }
        if self.extractor.backends.is_empty() {
            anyhow::bail!("extractor.backends 至少需要一个后端");
        }
        if let Some(unknown) = self
            .extractor
            .backends
            .iter()
            .find(|b| !KNOWN_BACKENDS.contains(&b.as_str()))
        {
            anyhow::bail!(
                "未知的解析后端: {}（可选 {}）",
                unknown,
                KNOWN_BACKENDS.join(" / ")
            );
        }
        if self.extractor.probe_timeout_secs == 0 || self.processing.timeout_secs == 0 {
            anyhow::bail!("超时时间必须大于 0");
        }
        Ok(())
    }

    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config.validate().context("配置文件校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.validate().context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);

        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                // 首次启动：自动创建默认下载目录
                if !default_config.download.download_dir.exists() {
                    if let Err(e) = std::fs::create_dir_all(&default_config.download.download_dir) {
                        tracing::error!(
                            "无法创建默认下载目录 {:?}: {}",
                            default_config.download.download_dir,
                            e
                        );
                    } else {
                        tracing::info!(
                            "✓ 已创建默认下载目录: {:?}",
                            default_config.download.download_dir
                        );
                    }
                }

                // 配置文件已存在但无效时不覆盖，保留给用户修改
                if !std::path::Path::new(path).exists() {
                    if let Err(e) = default_config.save_to_file(path).await {
                        tracing::error!("保存默认配置失败: {}", e);
                    }
                }

                default_config
            }
        }
    }
}
