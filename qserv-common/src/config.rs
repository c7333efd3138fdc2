//! Configuration for the dispatch/merge core, loaded from YAML.
//!
//! Mirrors the teacher's (`apollo-router`) pattern of one `serde`-derived
//! struct per subsystem, composed into a top-level `Config`. Nothing here is
//! read from environment variables directly; a CLI flag (see the `czar`/
//! `worker` binaries) points at a config file.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Priority classes run `0..num_classes`, 0 highest (spec.md section 4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QdispPoolConfig {
    /// Number of worker threads in the pool.
    pub num_threads: usize,
    /// `m_p`: minimum number of concurrently running commands guaranteed to
    /// each priority class while it has queued work, indexed by class.
    pub min_running_per_class: Vec<usize>,
}

impl Default for QdispPoolConfig {
    fn default() -> Self {
        Self {
            num_threads: 50,
            // interactive, fast, medium, slow/bulk
            min_running_per_class: vec![4, 2, 2, 1],
        }
    }
}

/// Bounds concurrent in-flight data pulls (czar) or transmits (worker).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PseudoFifoConfig {
    pub max_concurrent: usize,
}

impl Default for PseudoFifoConfig {
    fn default() -> Self {
        Self { max_concurrent: 32 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub max_job_attempts: u32,
    pub qdisp_pool: QdispPoolConfig,
    pub pseudo_fifo: PseudoFifoConfig,
    /// Size in bytes at which a worker flushes a result message rather than
    /// growing it further (spec.md section 6, "desired" limit).
    pub protobuf_desired_limit: usize,
    /// Hard cap; exceeding it is an invariant violation (spec.md section 6).
    pub protobuf_hard_limit: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_job_attempts: qserv_proto::DEFAULT_MAX_JOB_ATTEMPTS,
            qdisp_pool: QdispPoolConfig::default(),
            pseudo_fifo: PseudoFifoConfig::default(),
            protobuf_desired_limit: qserv_proto::PROTOBUFFER_DESIRED_LIMIT,
            protobuf_hard_limit: qserv_proto::PROTOBUFFER_HARD_LIMIT,
        }
    }
}

/// One scan-rating tier (spec.md section 4.8: fast/medium/slow/snail).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanTierConfig {
    pub name: String,
    pub max_concurrent_tasks: usize,
    /// Memory reserved per running Task on this tier, in bytes.
    pub memory_per_task_bytes: u64,
    /// A Task running longer than this is booted (spec.md section 4.8).
    pub time_budget_millis: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub tiers: Vec<ScanTierConfig>,
    /// Number of booted Tasks a UserQuery can accumulate before the rest of
    /// its Tasks are moved to the snail tier.
    pub boot_limit_before_snail: u32,
    /// `ChunkTableStats` exponential-smoothing weights (spec.md section 9:
    /// "hard-coded and undocumented ... treat as tunable config").
    pub stats_weight_avg: f64,
    pub stats_weight_new: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tiers: vec![
                ScanTierConfig {
                    name: "fast".into(),
                    max_concurrent_tasks: 16,
                    memory_per_task_bytes: 64 * 1024 * 1024,
                    time_budget_millis: 2_000,
                },
                ScanTierConfig {
                    name: "medium".into(),
                    max_concurrent_tasks: 8,
                    memory_per_task_bytes: 128 * 1024 * 1024,
                    time_budget_millis: 10_000,
                },
                ScanTierConfig {
                    name: "slow".into(),
                    max_concurrent_tasks: 4,
                    memory_per_task_bytes: 256 * 1024 * 1024,
                    time_budget_millis: 60_000,
                },
                ScanTierConfig {
                    name: "snail".into(),
                    max_concurrent_tasks: 1,
                    memory_per_task_bytes: 256 * 1024 * 1024,
                    time_budget_millis: 600_000,
                },
            ],
            boot_limit_before_snail: 3,
            stats_weight_avg: 49.0,
            stats_weight_new: 1.0,
        }
    }
}

/// Bounds concurrent MySQL connections for a role (merger writers, worker
/// query execution); spec.md section 5, "Shared-resource policy".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlConnMgrConfig {
    pub max_connections: usize,
}

impl Default for SqlConnMgrConfig {
    fn default() -> Self {
        Self { max_connections: 16 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MergeEngine {
    /// Single shared connection, no true parallel writers (spec.md section 4.7).
    MyIsam,
    /// Many concurrent writers gated by a semaphore.
    InnoDb,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfileMergerConfig {
    pub result_db: String,
    pub engine: MergeEngine,
    pub sql_conn_mgr: SqlConnMgrConfig,
    /// Total merged bytes across the whole UserQuery before it is failed
    /// (spec.md section 4.7, "merge byte cap").
    pub max_merged_bytes: u64,
    pub check_size_every_n_rows: u64,
}

impl Default for InfileMergerConfig {
    fn default() -> Self {
        Self {
            result_db: "qservResult".into(),
            engine: MergeEngine::InnoDb,
            sql_conn_mgr: SqlConnMgrConfig::default(),
            max_merged_bytes: 8 * 1024 * 1024 * 1024,
            check_size_every_n_rows: 1000,
        }
    }
}

/// Worker-process-only settings: its RPC bind address and the bounds its
/// `Foreman`/`Task` pipeline runs under (spec.md section 4.6, 4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub bind_addr: String,
    pub sql_conn_mgr: SqlConnMgrConfig,
    /// Size in bytes at which a Task flushes a batch of rows to its
    /// `ChannelShared` rather than growing it further.
    pub desired_limit_bytes: usize,
    /// Bound on concurrent in-flight response-stream transmits per channel
    /// (the worker-side `PseudoFifo`-like gate, spec.md section 4.6).
    pub transmit_concurrency: usize,
    /// Capacity of the `mpsc` channel backing each response stream.
    pub response_buffer: usize,
    /// Directory `FileChannelShared` writes large results into.
    pub results_dir: std::path::PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:50051".into(),
            sql_conn_mgr: SqlConnMgrConfig::default(),
            desired_limit_bytes: qserv_proto::PROTOBUFFER_DESIRED_LIMIT,
            transmit_concurrency: 32,
            response_buffer: 64,
            results_dir: std::path::PathBuf::from("/tmp/qserv-worker-results"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub dispatch: DispatchConfig,
    pub scheduler: SchedulerConfig,
    pub infile_merger: InfileMergerConfig,
    pub worker: WorkerConfig,
    /// Free-form extension point, mirroring the teacher's plugin
    /// configuration sections that aren't modeled as first-class structs.
    #[serde(default)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl Config {
    pub fn from_yaml_str(s: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(s)
    }

    pub fn from_file(path: &std::path::Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_yaml() {
        let cfg = Config::default();
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let parsed = Config::from_yaml_str(&yaml).unwrap();
        assert_eq!(parsed.dispatch.max_job_attempts, cfg.dispatch.max_job_attempts);
        assert_eq!(parsed.scheduler.tiers.len(), cfg.scheduler.tiers.len());
    }
}
