//! `BlendScheduler`/`ScanScheduler`: worker-side Task admission (spec.md
//! section 4.8). Tasks referencing the same major scan table are grouped
//! onto the `ScanScheduler` matching their slowest scan table's rating
//! (fast/medium/slow/snail), plus a separate interactive lane, so table
//! pages are reused across queries instead of every Task running
//! independently.

use crate::task::Task;
use qserv_common::config::SchedulerConfig;
use qserv_common::ids::JobId;
use qserv_common::stats::{ChunkTableKey, ChunkTableStats};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

/// One scan-rating tier's admission state: a concurrency cap, a memory
/// reservation, and a running-time budget past which a Task is booted.
pub struct ScanScheduler {
    pub name: String,
    max_concurrent_tasks: usize,
    concurrency: Arc<Semaphore>,
    memory_limit_bytes: u64,
    memory_in_use: AtomicU64,
    memory_available: Notify,
    memory_per_task_bytes: u64,
    pub time_budget: Duration,
    queue: parking_lot::Mutex<VecDeque<Arc<Task>>>,
    work_available: Notify,
}

impl ScanScheduler {
    pub fn new(name: impl Into<String>, max_concurrent_tasks: usize, memory_per_task_bytes: u64, time_budget: Duration) -> Arc<Self> {
        let max_concurrent_tasks = max_concurrent_tasks.max(1);
        Arc::new(Self {
            name: name.into(),
            max_concurrent_tasks,
            concurrency: Arc::new(Semaphore::new(max_concurrent_tasks)),
            memory_limit_bytes: memory_per_task_bytes * max_concurrent_tasks as u64,
            memory_in_use: AtomicU64::new(0),
            memory_available: Notify::new(),
            memory_per_task_bytes,
            time_budget,
            queue: parking_lot::Mutex::new(VecDeque::new()),
            work_available: Notify::new(),
        })
    }

    pub fn enqueue(&self, task: Arc<Task>) {
        self.queue.lock().push_back(task);
        self.work_available.notify_one();
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn running_count(&self) -> usize {
        self.max_concurrent_tasks - self.concurrency.available_permits()
    }

    /// Blocks until both a concurrency slot and a memory reservation of
    /// `memory_per_task_bytes` are available, then pops the next queued
    /// Task in FIFO order (spec.md section 4.8, "Tasks of the same chunk on
    /// the same scheduler are dispatched close together").
    pub async fn acquire_next(self: &Arc<Self>) -> Option<(Arc<Task>, ScanSlot)> {
        loop {
            let task = {
                let mut queue = self.queue.lock();
                queue.pop_front()
            };
            let Some(task) = task else {
                self.work_available.notified().await;
                continue;
            };
            let permit = self
                .concurrency
                .clone()
                .acquire_owned()
                .await
                .expect("scheduler semaphore is never closed");
            self.reserve_memory().await;
            return Some((
                task,
                ScanSlot {
                    scheduler: self.clone(),
                    _permit: permit,
                },
            ));
        }
    }

    async fn reserve_memory(&self) {
        loop {
            let current = self.memory_in_use.load(Ordering::Acquire);
            if current + self.memory_per_task_bytes <= self.memory_limit_bytes {
                if self
                    .memory_in_use
                    .compare_exchange(
                        current,
                        current + self.memory_per_task_bytes,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
                {
                    return;
                }
                continue;
            }
            self.memory_available.notified().await;
        }
    }

    fn release_memory(&self) {
        self.memory_in_use.fetch_sub(self.memory_per_task_bytes, Ordering::SeqCst);
        self.memory_available.notify_one();
    }
}

/// RAII handle held by `Foreman` for the duration of one Task's execution;
/// releases the concurrency permit and memory reservation on drop.
pub struct ScanSlot {
    scheduler: Arc<ScanScheduler>,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl Drop for ScanSlot {
    fn drop(&mut self) {
        self.scheduler.release_memory();
    }
}

/// Tracks how many Tasks one `UserQuery` has had booted across every
/// scheduler; past `boot_limit_before_snail`, its remaining Tasks are moved
/// to the snail tier (spec.md section 4.8).
#[derive(Default)]
pub struct BootTracker {
    counts: dashmap::DashMap<(u64, JobId), u32>,
}

impl BootTracker {
    pub fn record_boot(&self, query_id: u64, job_id: JobId) -> u32 {
        let mut entry = self.counts.entry((query_id, job_id)).or_insert(0);
        *entry += 1;
        *entry
    }
}

/// Owns every `ScanScheduler` tier plus the interactive lane and routes each
/// incoming Task to the tier matching its slowest scan table's rating.
pub struct BlendScheduler {
    pub interactive: Arc<ScanScheduler>,
    pub tiers: Vec<Arc<ScanScheduler>>,
    pub snail_index: usize,
    pub boot_limit_before_snail: u32,
    pub stats: Arc<ChunkTableStats>,
    boots: BootTracker,
}

impl BlendScheduler {
    pub fn new(config: &SchedulerConfig) -> Arc<Self> {
        let tiers: Vec<Arc<ScanScheduler>> = config
            .tiers
            .iter()
            .map(|t| {
                ScanScheduler::new(
                    t.name.clone(),
                    t.max_concurrent_tasks,
                    t.memory_per_task_bytes,
                    Duration::from_millis(t.time_budget_millis),
                )
            })
            .collect();
        let snail_index = tiers.len().saturating_sub(1);
        Arc::new(Self {
            interactive: ScanScheduler::new("interactive", usize::MAX, 0, Duration::from_secs(3600)),
            tiers,
            snail_index,
            boot_limit_before_snail: config.boot_limit_before_snail,
            stats: ChunkTableStats::new(config.stats_weight_avg, config.stats_weight_new),
            boots: BootTracker::default(),
        })
    }

    /// Routes `task` to the interactive lane or to the tier matching its
    /// slowest scan table's rolling-average completion time (slower average
    /// => lower-throughput tier), per spec.md section 4.8.
    pub fn route(&self, task: Arc<Task>) {
        if task.desc.interactive {
            self.interactive.enqueue(task);
            return;
        }
        let tier_index = self.tier_for(&task);
        self.tiers[tier_index].enqueue(task);
    }

    fn tier_for(&self, task: &Task) -> usize {
        if task.desc.scan_tables.is_empty() || self.tiers.is_empty() {
            return 0.min(self.tiers.len().saturating_sub(1));
        }
        let slowest_avg = task
            .desc
            .scan_tables
            .iter()
            .map(|table| {
                self.stats
                    .get(ChunkTableKey { chunk_id: task.desc.chunk_id, table: table.clone() })
                    .avg_millis
            })
            .fold(0.0f64, f64::max);
        // Bucket boundaries scale with each tier's own time budget, so a
        // Task whose observed average exceeds tier N's budget spills to
        // tier N+1 (spec.md section 4.8: "placed on the scheduler matching
        // its slowest scan table's rating").
        for (i, tier) in self.tiers.iter().enumerate() {
            if slowest_avg <= tier.time_budget.as_millis() as f64 || i == self.tiers.len() - 1 {
                return i;
            }
        }
        self.tiers.len() - 1
    }

    /// Called when a running Task exceeds its scheduler's time budget. Boots
    /// it (removing it from further consideration here — the caller decides
    /// cancel vs. resubmit to snail) and, once `boot_limit_before_snail` is
    /// exceeded for its UserQuery, routes the rest of that query's Tasks to
    /// snail going forward.
    pub fn record_boot(&self, task: &Task) -> bool {
        if !task.boot() {
            return false; // already booted once
        }
        for table in &task.desc.scan_tables {
            self.stats.record_boot(ChunkTableKey { chunk_id: task.desc.chunk_id, table: table.clone() });
        }
        let boots = self.boots.record_boot(task.desc.query_id, task.desc.job_id);
        boots > self.boot_limit_before_snail
    }

    pub fn snail(&self) -> &Arc<ScanScheduler> {
        &self.tiers[self.snail_index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel_shared::StreamChannelShared;
    use crate::task::TaskDescription;

    fn desc(chunk_id: i32, scan_tables: Vec<String>) -> TaskDescription {
        TaskDescription {
            query_id: 1,
            job_id: 1,
            attempt_count: 0,
            chunk_id,
            fragment_index: 0,
            sql: "SELECT 1".into(),
            priority: 0,
            interactive: false,
            scan_tables,
        }
    }

    fn dummy_task(chunk_id: i32, scan_tables: Vec<String>) -> Arc<Task> {
        let (tx, _rx) = tokio::sync::mpsc::channel(16);
        let channel: Arc<dyn crate::channel_shared::ChannelShared> = StreamChannelShared::new(tx, 1, 4);
        Task::new(desc(chunk_id, scan_tables), &channel)
    }

    #[tokio::test]
    async fn acquire_next_serves_tasks_in_fifo_order() {
        let scheduler = ScanScheduler::new("fast", 1, 1024, Duration::from_secs(1));
        for i in 0..3 {
            scheduler.enqueue(dummy_task(i, vec![]));
        }
        let mut seen = Vec::new();
        for _ in 0..3 {
            let (task, slot) = scheduler.acquire_next().await.unwrap();
            seen.push(task.desc.chunk_id);
            drop(slot);
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn running_count_reflects_held_slots() {
        let scheduler = ScanScheduler::new("fast", 2, 1024, Duration::from_secs(1));
        scheduler.enqueue(dummy_task(0, vec![]));
        assert_eq!(scheduler.running_count(), 0);
        let (_task, slot) = scheduler.acquire_next().await.unwrap();
        assert_eq!(scheduler.running_count(), 1);
        drop(slot);
        assert_eq!(scheduler.running_count(), 0);
    }

    #[test]
    fn boot_tracker_counts_independently_per_job() {
        let boots = BootTracker::default();
        assert_eq!(boots.record_boot(1, 5), 1);
        assert_eq!(boots.record_boot(1, 5), 2);
        assert_eq!(boots.record_boot(1, 6), 1);
    }

    #[test]
    fn record_boot_trips_snail_only_past_the_limit() {
        let mut config = SchedulerConfig::default();
        config.boot_limit_before_snail = 1;
        let blend = BlendScheduler::new(&config);
        let task = dummy_task(0, vec![]);

        assert!(!blend.record_boot(&task), "first boot must stay under the limit");
        // `Task::boot()` is a one-shot latch; simulate a second distinct
        // overrun with a fresh task for the same UserQuery/job.
        let task2 = dummy_task(0, vec![]);
        assert!(blend.record_boot(&task2), "second boot for this job exceeds boot_limit_before_snail=1");
    }

    #[test]
    fn tier_for_routes_by_slowest_scan_tables_rolling_average() {
        let blend = BlendScheduler::new(&SchedulerConfig::default());
        blend.stats.record_completion(ChunkTableKey { chunk_id: 7, table: "Object".into() }, 500.0);
        let fast_task = dummy_task(7, vec!["Object".into()]);
        assert_eq!(blend.tier_for(&fast_task), 0);

        blend.stats.record_completion(ChunkTableKey { chunk_id: 7, table: "Source".into() }, 50_000.0);
        let slow_task = dummy_task(7, vec!["Source".into()]);
        assert_eq!(blend.tier_for(&slow_task), 2);
    }
}
