//! 后处理
//!
//! 只有请求了时间范围裁剪或音频提取时才会进入 processing 阶段，
//! 其余任务传输完成后直接 finished。

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::error::{DownloadError, DownloadResult, TimeoutPhase};
use super::task::{DownloadOptions, DownloadType};

/// 后处理计划
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessPlan {
    /// 裁剪起点（秒）
    pub start_time: Option<u64>,
    /// 裁剪终点（秒）
    pub end_time: Option<u64>,
    /// 提取音频时的编码参数，None 表示保留原始流
    pub audio: Option<AudioTarget>,
}

/// 音频提取目标
#[derive(Debug, Clone, PartialEq)]
pub struct AudioTarget {
    /// 输出扩展名
    pub ext: String,
    /// ffmpeg 编码器名
    pub codec: String,
    /// 码率，如 "192k"
    pub bitrate: String,
}

impl AudioTarget {
    /// 由配置中的编码名构造，目前支持 mp3/aac/opus
    pub fn from_codec(codec: &str, bitrate: &str) -> Self {
        let (ext, encoder) = match codec.to_ascii_lowercase().as_str() {
            "aac" | "m4a" => ("m4a", "aac"),
            "opus" => ("opus", "libopus"),
            _ => ("mp3", "libmp3lame"),
        };
        Self {
            ext: ext.to_string(),
            codec: encoder.to_string(),
            bitrate: bitrate.to_string(),
        }
    }
}

impl ProcessPlan {
    /// 根据下载选项生成计划，不需要后处理时返回 None
    ///
    /// audio 为 None 时音频任务保留原始容器，不转码
    pub fn from_options(options: &DownloadOptions, audio: Option<&AudioTarget>) -> Option<Self> {
        let audio = audio.filter(|_| options.download_type == DownloadType::Audio);
        if !options.wants_trim() && audio.is_none() {
            return None;
        }
        Some(Self {
            start_time: options.start_time,
            end_time: options.end_time,
            audio: audio.cloned(),
        })
    }

    /// 产物扩展名
    pub fn output_ext<'a>(&'a self, source_ext: &'a str) -> &'a str {
        match &self.audio {
            Some(target) => &target.ext,
            None => source_ext,
        }
    }

    /// 生成 ffmpeg 参数
    pub fn ffmpeg_args(&self, input: &Path, output: &Path) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-y".into(),
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
        ];
        if let Some(start) = self.start_time {
            args.push("-ss".into());
            args.push(start.to_string());
        }
        if let Some(end) = self.end_time {
            args.push("-to".into());
            args.push(end.to_string());
        }
        args.push("-i".into());
        args.push(input.to_string_lossy().into_owned());

        match &self.audio {
            Some(target) => {
                args.extend([
                    "-vn".to_string(),
                    "-acodec".to_string(),
                    target.codec.clone(),
                    "-b:a".to_string(),
                    target.bitrate.clone(),
                ]);
            }
            None => {
                args.extend(["-c".to_string(), "copy".to_string()]);
            }
        }

        args.push(output.to_string_lossy().into_owned());
        args
    }
}

/// 后处理器
#[async_trait]
pub trait PostProcessor: Send + Sync {
    /// 处理 input 并写出 output
    ///
    /// 取消令牌触发时应尽快返回 `DownloadError::Cancelled`
    async fn process(
        &self,
        input: &Path,
        output: &Path,
        plan: &ProcessPlan,
        cancel: &CancellationToken,
    ) -> DownloadResult<()>;
}

/// 基于 ffmpeg 可执行文件的后处理器
#[derive(Debug, Clone)]
pub struct FfmpegProcessor {
    binary: PathBuf,
    timeout: Duration,
}

impl FfmpegProcessor {
    pub fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self { binary, timeout }
    }
}

#[async_trait]
impl PostProcessor for FfmpegProcessor {
    async fn process(
        &self,
        input: &Path,
        output: &Path,
        plan: &ProcessPlan,
        cancel: &CancellationToken,
    ) -> DownloadResult<()> {
        let args = plan.ffmpeg_args(input, output);
        debug!("执行 ffmpeg: {:?} {:?}", self.binary, args);

        let child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DownloadError::Processing(format!("无法启动 {:?}: {}", self.binary, e))
            })?;

        // 取消或超时时丢弃 future，kill_on_drop 结束子进程
        let output_result = tokio::select! {
            result = child.wait_with_output() => result,
            _ = cancel.cancelled() => {
                info!("后处理被取消: {:?}", input);
                return Err(DownloadError::Cancelled);
            }
            _ = tokio::time::sleep(self.timeout) => {
                return Err(DownloadError::Timeout {
                    phase: TimeoutPhase::Processing,
                    secs: self.timeout.as_secs(),
                });
            }
        };

        let result = output_result.map_err(|e| DownloadError::Processing(e.to_string()))?;
        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let last_line = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("ffmpeg 返回非零状态")
                .trim()
                .to_string();
            return Err(DownloadError::Processing(last_line));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::task::OutputFormat;

    fn mp3() -> AudioTarget {
        AudioTarget::from_codec("mp3", "192k")
    }

    #[test]
    fn test_no_plan_without_trim_or_audio() {
        assert!(ProcessPlan::from_options(&DownloadOptions::default(), Some(&mp3())).is_none());

        let full = DownloadOptions::new(DownloadType::Full, OutputFormat::Best, None, None).unwrap();
        assert!(ProcessPlan::from_options(&full, Some(&mp3())).is_none());
    }

    #[test]
    fn test_trim_plan_copies_streams() {
        let options =
            DownloadOptions::new(DownloadType::Video, OutputFormat::Mp4, Some(5), Some(20)).unwrap();
        let plan = ProcessPlan::from_options(&options, Some(&mp3())).unwrap();
        assert_eq!(plan.output_ext("mp4"), "mp4");

        let args = plan.ffmpeg_args(Path::new("/in.part"), Path::new("/out.mp4"));
        let joined = args.join(" ");
        assert!(joined.contains("-ss 5 -to 20 -i /in.part"));
        assert!(joined.ends_with("-c copy /out.mp4"));
    }

    #[test]
    fn test_audio_plan_transcodes() {
        let options = DownloadOptions::new(DownloadType::Audio, OutputFormat::Best, None, None).unwrap();
        assert!(ProcessPlan::from_options(&options, None).is_none());

        let plan = ProcessPlan::from_options(&options, Some(&mp3())).unwrap();
        assert_eq!(plan.output_ext("webm"), "mp3");

        let args = plan.ffmpeg_args(Path::new("/in.part"), Path::new("/out.mp3"));
        assert!(!args.contains(&"-ss".to_string()));
        let joined = args.join(" ");
        assert!(joined.contains("-vn -acodec libmp3lame -b:a 192k /out.mp3"));
    }

    #[test]
    fn test_audio_target_codecs() {
        assert_eq!(AudioTarget::from_codec("AAC", "128k").ext, "m4a");
        assert_eq!(AudioTarget::from_codec("opus", "96k").codec, "libopus");
        assert_eq!(AudioTarget::from_codec("unknown", "192k").codec, "libmp3lame");
    }

    #[tokio::test]
    async fn test_missing_binary_is_processing_error() {
        let processor = FfmpegProcessor::new(
            PathBuf::from("/nonexistent/ffmpeg-binary"),
            Duration::from_secs(5),
        );
        let plan = ProcessPlan {
            start_time: Some(1),
            end_time: None,
            audio: None,
        };
        let err = processor
            .process(
                Path::new("/tmp/in"),
                Path::new("/tmp/out"),
                &plan,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Processing(_)));
    }
}
