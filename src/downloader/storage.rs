//! 任务文件存储
//!
//! 每个任务独占 `download_dir/<job_id>/` 目录：
//! - 传输中写入 `<job_id>.part`
//! - 完成后重命名为 `<标题>_<上传者>.<扩展名>`
//! - 取消、失败、过期清理时整个目录删除

use std::path::PathBuf;

use tracing::{debug, warn};

use super::error::DownloadResult;

/// 单个文件名的最大字节数
const NAME_MAX: usize = 200;

/// 清理文件名中的非法字符
///
/// - 路径分隔符、控制字符以及 Windows 保留字符替换为 `_`
/// - 连续的 `_` 合并
/// - 去掉首尾空白和点
/// - 按字节截断，保持 UTF-8 边界
pub fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_underscore = false;

    for c in name.chars() {
        let replaced = match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        };
        if replaced == '_' {
            if !prev_underscore {
                out.push('_');
            }
            prev_underscore = true;
        } else {
            out.push(replaced);
            prev_underscore = false;
        }
    }

    let trimmed = out.trim_matches(|c: char| c.is_whitespace() || c == '.' || c == '_');
    let mut take = trimmed.len().min(NAME_MAX);
    while take > 0 && !trimmed.is_char_boundary(take) {
        take -= 1;
    }
    trimmed[..take].trim_end().to_string()
}

/// 由标题、上传者和扩展名生成产物文件名
pub fn output_file_name(title: &str, uploader: &str, ext: &str) -> String {
    let base = if uploader.trim().is_empty() {
        title.to_string()
    } else {
        format!("{}_{}", title, uploader)
    };
    let mut stem = sanitize_filename(&base);
    if stem.is_empty() {
        stem = "video".to_string();
    }
    let ext = sanitize_filename(ext);
    if ext.is_empty() {
        stem
    } else {
        format!("{}.{}", stem, ext.to_ascii_lowercase())
    }
}

/// 任务文件存储
#[derive(Debug, Clone)]
pub struct JobStorage {
    root: PathBuf,
}

impl JobStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// 任务工作目录
    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.root.join(job_id)
    }

    /// 创建任务工作目录
    pub async fn prepare(&self, job_id: &str) -> DownloadResult<PathBuf> {
        let dir = self.job_dir(job_id);
        tokio::fs::create_dir_all(&dir).await?;
        debug!("准备任务目录: {:?}", dir);
        Ok(dir)
    }

    /// 传输中的临时文件
    pub fn part_path(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join(format!("{}.part", job_id))
    }

    /// 后处理中间文件
    pub fn processing_path(&self, job_id: &str, ext: &str) -> PathBuf {
        self.job_dir(job_id).join(format!("{}.processing.{}", job_id, ext))
    }

    /// 产物最终路径
    pub fn final_path(&self, job_id: &str, file_name: &str) -> PathBuf {
        self.job_dir(job_id).join(file_name)
    }

    /// 删除任务目录及其中所有文件，目录不存在时视为成功
    pub async fn discard(&self, job_id: &str) {
        let dir = self.job_dir(job_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => debug!("已清理任务目录: {:?}", dir),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("清理任务目录失败: {:?}, 错误: {}", dir, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_replaces_reserved_chars() {
        assert_eq!(sanitize_filename("a/b\\c:d"), "a_b_c_d");
        assert_eq!(sanitize_filename("what?*|<>\"now"), "what_now");
        assert_eq!(sanitize_filename("tab\there"), "tab_here");
    }

    #[test]
    fn test_sanitize_trims_and_keeps_unicode() {
        assert_eq!(sanitize_filename("  ..标题 Title..  "), "标题 Title");
        assert_eq!(sanitize_filename("///"), "");
    }

    #[test]
    fn test_sanitize_truncates_on_char_boundary() {
        let long = "视".repeat(200);
        let out = sanitize_filename(&long);
        assert!(out.len() <= NAME_MAX);
        assert!(out.chars().all(|c| c == '视'));
    }

    #[test]
    fn test_output_file_name() {
        assert_eq!(output_file_name("My Clip", "Alice", "MP4"), "My Clip_Alice.mp4");
        assert_eq!(output_file_name("My Clip", "", "webm"), "My Clip.webm");
        assert_eq!(output_file_name("../..", "", "mp3"), "video.mp3");
    }

    #[tokio::test]
    async fn test_prepare_and_discard() {
        let temp = TempDir::new().unwrap();
        let storage = JobStorage::new(temp.path());

        let dir = storage.prepare("job-1").await.unwrap();
        assert!(dir.is_dir());
        tokio::fs::write(storage.part_path("job-1"), b"partial").await.unwrap();

        storage.discard("job-1").await;
        assert!(!dir.exists());

        // 重复清理不报错
        storage.discard("job-1").await;
    }
}
