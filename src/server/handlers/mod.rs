// API处理器模块

pub mod system;
pub mod video;

pub use system::*;
pub use video::*;
