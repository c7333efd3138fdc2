//! `Foreman`: ties `BlendScheduler`, `SqlConnMgr`, and Task execution into
//! one worker-side dispatch loop (spec.md section 4.8; grounded on
//! `examples/original_source/src/wcontrol/Foreman.cc`, which plays the same
//! role of handing scheduled Tasks to a thread pool and tracking query
//! status). A Task that overruns its scheduler's time budget is booted; once
//! its UserQuery accumulates more boots than `boot_limit_before_snail`, the
//! rest of that query's Tasks are requeued onto the snail tier instead of
//! being cancelled outright.

use crate::channel_shared::ChannelShared;
use crate::scheduler::BlendScheduler;
use crate::sql_conn_mgr::SqlConnMgr;
use crate::task::{QueryExecutor, Task};
use qserv_common::stats::ChunkTableKey;
use std::sync::Arc;
use std::time::Instant;

pub struct Foreman {
    blend: Arc<BlendScheduler>,
    conn_mgr: Arc<SqlConnMgr>,
    executor: Arc<dyn QueryExecutor>,
    desired_limit_bytes: usize,
}

impl Foreman {
    pub fn new(
        blend: Arc<BlendScheduler>,
        conn_mgr: Arc<SqlConnMgr>,
        executor: Arc<dyn QueryExecutor>,
        desired_limit_bytes: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            blend,
            conn_mgr,
            executor,
            desired_limit_bytes,
        })
    }

    /// Submits a Task for execution, routing it through the blend scheduler
    /// (spec.md section 4.8). Returns immediately; the Task runs on a
    /// spawned dispatch loop.
    pub fn queue_task(&self, task: Arc<Task>) {
        self.blend.route(task);
    }

    /// Spawns one perpetual dispatch loop per scan tier (plus the
    /// interactive lane), each pulling the next admitted Task and racing its
    /// execution against the tier's time budget. Returns the join handles so
    /// callers can await a clean shutdown.
    pub fn spawn_dispatch_loops(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        handles.push(self.spawn_loop_for(self.blend.interactive.clone()));
        for tier in &self.blend.tiers {
            handles.push(self.spawn_loop_for(tier.clone()));
        }
        handles
    }

    fn spawn_loop_for(self: &Arc<Self>, scheduler: Arc<crate::scheduler::ScanScheduler>) -> tokio::task::JoinHandle<()> {
        let foreman = self.clone();
        tokio::spawn(async move {
            loop {
                let Some((task, slot)) = scheduler.acquire_next().await else {
                    continue;
                };
                let foreman = foreman.clone();
                let time_budget = scheduler.time_budget;
                tokio::spawn(async move {
                    foreman.run_one(task, time_budget).await;
                    drop(slot);
                });
            }
        })
    }

    async fn run_one(self: &Arc<Self>, task: Arc<Task>, time_budget: std::time::Duration) {
        let started = Instant::now();
        let run = task.run(&self.conn_mgr, self.executor.as_ref(), self.desired_limit_bytes);
        match tokio::time::timeout(time_budget, run).await {
            Ok(Ok(())) => {
                let elapsed = started.elapsed().as_millis() as f64;
                for table in &task.desc.scan_tables {
                    self.blend.stats.record_completion(
                        ChunkTableKey { chunk_id: task.desc.chunk_id, table: table.clone() },
                        elapsed,
                    );
                }
            }
            Ok(Err(error)) => {
                tracing::warn!(
                    query_id = task.desc.query_id,
                    job_id = task.desc.job_id,
                    %error,
                    "task failed"
                );
            }
            Err(_elapsed) => {
                tracing::warn!(
                    query_id = task.desc.query_id,
                    job_id = task.desc.job_id,
                    tier_budget_ms = time_budget.as_millis() as u64,
                    "task exceeded its scheduler's time budget, booting"
                );
                let move_to_snail = self.blend.record_boot(&task);
                task.cancel();
                if move_to_snail {
                    tracing::warn!(
                        query_id = task.desc.query_id,
                        job_id = task.desc.job_id,
                        "boot limit exceeded, routing remaining tasks for this query to the snail tier"
                    );
                    self.blend.snail().enqueue(task);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel_shared::StreamChannelShared;
    use crate::task::TaskDescription;
    use async_trait::async_trait;
    use futures::stream;
    use qserv_common::config::SchedulerConfig;
    use qserv_common::error::DispatchError;
    use std::time::Duration;

    struct ImmediateExecutor;

    #[async_trait]
    impl QueryExecutor for ImmediateExecutor {
        async fn execute(&self, _sql: &str) -> Result<crate::task::RowStream, DispatchError> {
            Ok(Box::pin(stream::iter(vec![Ok(vec![1u8, 2, 3])])))
        }
    }

    struct StallingExecutor;

    #[async_trait]
    impl QueryExecutor for StallingExecutor {
        async fn execute(&self, _sql: &str) -> Result<crate::task::RowStream, DispatchError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!("timeout should fire first");
        }
    }

    fn desc() -> TaskDescription {
        TaskDescription {
            query_id: 1,
            job_id: 9,
            attempt_count: 0,
            chunk_id: 4,
            fragment_index: 0,
            sql: "SELECT 1".into(),
            priority: 0,
            interactive: true,
            scan_tables: vec!["Object".into()],
        }
    }

    #[tokio::test]
    async fn completed_task_updates_chunk_table_stats() {
        let blend = BlendScheduler::new(&SchedulerConfig::default());
        let conn_mgr = SqlConnMgr::new(4);
        let foreman = Foreman::new(blend.clone(), conn_mgr, Arc::new(ImmediateExecutor), 1024 * 1024);
        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        let channel: Arc<dyn ChannelShared> = StreamChannelShared::new(tx, 1, 4);
        let task = Task::new(desc(), &channel);

        foreman.run_one(task.clone(), Duration::from_secs(5)).await;
        let stats = blend
            .stats
            .get(ChunkTableKey { chunk_id: 4, table: "Object".into() });
        assert!(stats.avg_millis > 0.0);
        drop(rx.recv().await);
    }

    #[tokio::test]
    async fn overrun_task_is_booted() {
        let blend = BlendScheduler::new(&SchedulerConfig::default());
        let conn_mgr = SqlConnMgr::new(4);
        let foreman = Foreman::new(blend, conn_mgr, Arc::new(StallingExecutor), 1024 * 1024);
        let (tx, _rx) = tokio::sync::mpsc::channel(16);
        let channel: Arc<dyn ChannelShared> = StreamChannelShared::new(tx, 1, 4);
        let task = Task::new(desc(), &channel);

        foreman.run_one(task.clone(), Duration::from_millis(20)).await;
        assert!(task.is_booted());
        assert!(task.is_cancelled());
    }
}
