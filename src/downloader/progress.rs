//! 进度统计
//!
//! - `SpeedCalculator`: 滑动窗口速度估算
//! - `ProgressThrottler`: 进度写入节流，节流间隔同时是取消响应的最大延迟

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 200;

/// 默认速度窗口
pub const DEFAULT_SPEED_WINDOW: Duration = Duration::from_secs(3);

/// 滑动窗口速度计算器
#[derive(Debug)]
pub struct SpeedCalculator {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
    window_bytes: u64,
}

impl SpeedCalculator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
            window_bytes: 0,
        }
    }

    pub fn with_default_window() -> Self {
        Self::new(DEFAULT_SPEED_WINDOW)
    }

    /// 记录一次读取
    pub fn add_sample(&mut self, bytes: u64) {
        self.add_sample_at(Instant::now(), bytes);
    }

    fn add_sample_at(&mut self, at: Instant, bytes: u64) {
        self.samples.push_back((at, bytes));
        self.window_bytes += bytes;
        self.evict(at);
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(t, bytes)) = self.samples.front() {
            if now.duration_since(t) <= self.window {
                break;
            }
            self.samples.pop_front();
            self.window_bytes -= bytes;
        }
    }

    /// 当前速度 (bytes/s)
    pub fn speed(&self) -> u64 {
        self.speed_at(Instant::now())
    }

    fn speed_at(&self, now: Instant) -> u64 {
        let Some(&(first, _)) = self.samples.front() else {
            return 0;
        };
        // 窗口内只有一个样本时按 1 秒近似，避免除以极小值
        let elapsed = now.duration_since(first).as_secs_f64().max(1.0);
        (self.window_bytes as f64 / elapsed) as u64
    }
}

/// 进度写入节流器
///
/// 使用原子操作，可在多个任务间共享
#[derive(Debug)]
pub struct ProgressThrottler {
    origin: Instant,
    /// 上次放行距 origin 的纳秒数，u64::MAX 表示尚未放行
    last_emit_nanos: AtomicU64,
    interval_nanos: u64,
}

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            origin: Instant::now(),
            last_emit_nanos: AtomicU64::new(u64::MAX),
            interval_nanos: interval.as_nanos() as u64,
        }
    }

    /// 距上次放行超过间隔时返回 true 并更新时间戳
    pub fn should_emit(&self) -> bool {
        let now = self.origin.elapsed().as_nanos() as u64;
        let last = self.last_emit_nanos.load(Ordering::Relaxed);

        if last != u64::MAX && now.saturating_sub(last) < self.interval_nanos {
            return false;
        }
        self.last_emit_nanos
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}
