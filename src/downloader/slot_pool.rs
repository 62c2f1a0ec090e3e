//! 任务位池管理模块
//!
//! 管理任务级槽位，决定哪些任务能获得运行资格。
//! 槽位数即最大同时下载数，支持运行时调整。

use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// 任务位
#[derive(Debug, Clone)]
pub struct TaskSlot {
    /// 槽位ID
    pub id: usize,
    /// 占用此位的任务ID
    pub job_id: Option<String>,
}

impl TaskSlot {
    fn new(id: usize) -> Self {
        Self { id, job_id: None }
    }

    /// 检查槽位是否空闲
    pub fn is_free(&self) -> bool {
        self.job_id.is_none()
    }
}

/// 任务位池管理器
#[derive(Debug)]
pub struct TaskSlotPool {
    /// 最大槽位数（支持动态调整）
    max_slots: AtomicUsize,
    /// 槽位列表
    slots: RwLock<Vec<TaskSlot>>,
}

impl TaskSlotPool {
    /// 创建新的任务位池
    pub fn new(max_slots: usize) -> Self {
        let slots = (0..max_slots).map(TaskSlot::new).collect();

        info!("创建任务位池，最大槽位数: {}", max_slots);

        Self {
            max_slots: AtomicUsize::new(max_slots),
            slots: RwLock::new(slots),
        }
    }

    /// 获取最大槽位数
    pub fn max_slots(&self) -> usize {
        self.max_slots.load(Ordering::SeqCst)
    }

    /// 动态调整槽位池容量
    ///
    /// 缩容不会中断已占用的槽位，超出新上限的任务继续运行到完成，
    /// 新的分配只会在新上限范围内进行
    pub async fn resize(&self, new_max: usize) {
        let old_max = self.max_slots.load(Ordering::SeqCst);
        if new_max == old_max {
            debug!("任务位池容量无需调整: {}", old_max);
            return;
        }

        let mut slots = self.slots.write().await;

        if new_max > old_max {
            let existing: Vec<usize> = slots.iter().map(|s| s.id).collect();
            for i in old_max..new_max {
                if !existing.contains(&i) {
                    slots.push(TaskSlot::new(i));
                }
            }
            info!("任务位池扩容: {} -> {}", old_max, new_max);
        } else {
            let occupied_beyond_limit = slots
                .iter()
                .filter(|s| s.id >= new_max && !s.is_free())
                .count();

            if occupied_beyond_limit > 0 {
                warn!(
                    "任务位池缩容: {} -> {} (有 {} 个超出新上限的槽位仍被占用，将继续运行)",
                    old_max, new_max, occupied_beyond_limit
                );
            }
            slots.retain(|s| s.id < new_max || !s.is_free());
            info!("任务位池缩容: {} -> {}", old_max, new_max);
        }

        self.max_slots.store(new_max, Ordering::SeqCst);
    }

    /// 尝试分配任务位
    ///
    /// 分配成功返回 Some(slot_id)，否则返回 None
    pub async fn allocate(&self, job_id: &str) -> Option<usize> {
        let max_slots = self.max_slots.load(Ordering::SeqCst);
        let mut slots = self.slots.write().await;

        // 超上限占用的槽位也计入，缩容期间不会超发
        let used = slots.iter().filter(|s| !s.is_free()).count();
        if used >= max_slots {
            debug!("无可用任务位: job_id={}", job_id);
            return None;
        }

        for slot in slots.iter_mut() {
            if slot.id < max_slots && slot.is_free() {
                slot.job_id = Some(job_id.to_string());
                debug!("分配任务位: slot_id={}, job_id={}", slot.id, job_id);
                return Some(slot.id);
            }
        }
        None
    }

    /// 释放任务占用的槽位，返回是否确实释放
    pub async fn release(&self, job_id: &str) -> bool {
        let max_slots = self.max_slots.load(Ordering::SeqCst);
        let mut slots = self.slots.write().await;
        let Some(slot) = slots
            .iter_mut()
            .find(|s| s.job_id.as_deref() == Some(job_id))
        else {
            return false;
        };
        debug!("释放任务位: slot_id={}, job_id={}", slot.id, job_id);
        slot.job_id = None;
        // 缩容后遗留的槽位释放即移除
        slots.retain(|s| s.id < max_slots || !s.is_free());
        true
    }

    /// 获取当前已使用槽位数
    pub async fn used_slots(&self) -> usize {
        let slots = self.slots.read().await;
        slots.iter().filter(|s| !s.is_free()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allocate_until_full() {
        let pool = TaskSlotPool::new(2);
        assert_eq!(pool.allocate("a").await, Some(0));
        assert_eq!(pool.allocate("b").await, Some(1));
        assert_eq!(pool.allocate("c").await, None);
        assert_eq!(pool.used_slots().await, 2);

        assert!(pool.release("a").await);
        assert!(!pool.release("a").await);
        assert_eq!(pool.allocate("c").await, Some(0));
        assert_eq!(pool.used_slots().await, 2);
    }

    #[tokio::test]
    async fn test_resize_grow() {
        let pool = TaskSlotPool::new(1);
        pool.allocate("a").await;
        assert_eq!(pool.allocate("b").await, None);

        pool.resize(3).await;
        assert_eq!(pool.max_slots(), 3);
        assert!(pool.allocate("b").await.is_some());
        assert!(pool.allocate("c").await.is_some());
        assert_eq!(pool.allocate("d").await, None);
    }

    #[tokio::test]
    async fn test_resize_shrink_keeps_running_jobs() {
        let pool = TaskSlotPool::new(3);
        pool.allocate("a").await;
        pool.allocate("b").await;
        pool.allocate("c").await;

        pool.resize(1).await;
        assert_eq!(pool.used_slots().await, 3);
        assert_eq!(pool.allocate("d").await, None);

        pool.release("c").await;
        pool.release("b").await;
        assert_eq!(pool.allocate("d").await, None);

        pool.release("a").await;
        assert_eq!(pool.allocate("d").await, Some(0));
    }
}
