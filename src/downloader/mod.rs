pub mod error;
pub mod extractor;
pub mod manager;
pub mod processor;
pub mod progress;
pub mod runner;
pub mod slot_pool;
pub mod storage;
pub mod store;
pub mod task;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{DownloadError, DownloadResult, TimeoutPhase};
pub use extractor::{
    DirectHttpExtractor, ExtractError, Extractor, ExtractorChain, FormatInfo, MediaInfo,
    MediaSource, SizeHint, YtDlpExtractor,
};
pub use manager::{Artifact, DownloadManager};
pub use processor::{FfmpegProcessor, PostProcessor, ProcessPlan};
pub use progress::{ProgressThrottler, SpeedCalculator};
pub use runner::{JobRunner, RunnerSettings};
pub use slot_pool::{TaskSlot, TaskSlotPool};
pub use storage::JobStorage;
pub use store::JobStore;
pub use task::{validate_url, DownloadJob, DownloadOptions, DownloadType, JobStatus, OutputFormat};
