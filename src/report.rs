//! Result artifacts and resource-usage sampling.
//!
//! The run report is a fixed-shape document: every field the wire format
//! carries is a named struct field, so a typo is a compile error rather
//! than a silently missing key. A lighter live file with just the current
//! throughput is rewritten once per second during a run for external
//! dashboards to poll.

use crate::config::Config;
use crate::metrics::MetricsSnapshot;
use crate::pool::PoolTotals;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Derived run-level metrics.
#[derive(Debug, Clone, Serialize)]
pub struct RunMetrics {
    pub throughput: f64,
    pub total_clients_served: u64,
    pub total_lost_clients: u64,
    pub average_rating: f64,
    pub average_response_time: f64,
    pub server_utilization: f64,
    pub simulation_time: f64,
    pub approach: &'static str,
}

/// Per-server breakdown carried alongside the run metrics.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStats {
    pub server_name: String,
    pub clients_served: u64,
    pub lost_clients: u64,
    pub rejected_clients: u64,
    pub average_rating: f64,
    pub utilization: f64,
}

/// CPU/memory/disk usage averaged over the run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceMetrics {
    pub avg_cpu_usage: f64,
    pub avg_memory_usage: f64,
    pub disk_io_read: f64,
    pub disk_io_write: f64,
}

/// FAILED means the run served zero clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    #[serde(rename = "PASSED")]
    Passed,
    #[serde(rename = "FAILED")]
    Failed,
}

/// The JSON result artifact written at the end of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub metrics: RunMetrics,
    pub performance_metrics: PerformanceMetrics,
    pub server_stats: Vec<ServerStats>,
    pub total_clients: usize,
    pub total_servers: usize,
    pub status: RunStatus,
}

impl RunReport {
    pub fn build(
        config: &Config,
        elapsed: Duration,
        snapshots: &[MetricsSnapshot],
        performance: PerformanceMetrics,
    ) -> Self {
        let totals = PoolTotals::from_snapshots(snapshots);
        let secs = elapsed.as_secs_f64();
        let throughput = if secs > 0.0 {
            totals.served as f64 / secs
        } else {
            0.0
        };
        let utilization = if snapshots.is_empty() {
            0.0
        } else {
            snapshots.iter().map(|s| s.utilization()).sum::<f64>() / snapshots.len() as f64
        };

        let server_stats = snapshots
            .iter()
            .map(|snap| ServerStats {
                server_name: snap.server.clone(),
                clients_served: snap.served,
                lost_clients: snap.lost,
                rejected_clients: snap.rejected,
                average_rating: round2(snap.average_rating()),
                utilization: round4(snap.utilization()),
            })
            .collect();

        let status = if totals.served > 0 {
            RunStatus::Passed
        } else {
            RunStatus::Failed
        };

        RunReport {
            metrics: RunMetrics {
                throughput: round2(throughput),
                total_clients_served: totals.served,
                total_lost_clients: totals.lost,
                average_rating: round2(totals.average_rating()),
                average_response_time: round4(
                    totals.service_time.as_secs_f64() / totals.served.max(1) as f64,
                ),
                server_utilization: round4(utilization),
                simulation_time: round2(secs),
                approach: config.strategy.label(),
            },
            performance_metrics: performance,
            server_stats,
            total_clients: config.num_clients,
            total_servers: config.num_servers,
            status,
        }
    }

    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json)
    }
}

#[derive(Serialize)]
struct LiveFile {
    metrics: LiveMetrics,
}

#[derive(Serialize)]
struct LiveMetrics {
    throughput: f64,
}

/// Rewrite the live metrics file with the current throughput.
pub fn write_live(path: &Path, throughput: f64) {
    let live = LiveFile {
        metrics: LiveMetrics {
            throughput: round2(throughput),
        },
    };
    let result = serde_json::to_vec(&live)
        .map_err(std::io::Error::from)
        .and_then(|json| std::fs::write(path, json));
    if let Err(e) = result {
        warn!(error = %e, path = %path.display(), "Failed to write live metrics");
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Samples CPU, memory, and this process's disk I/O once per second.
pub struct ResourceMonitor {
    stop: watch::Sender<bool>,
    task: JoinHandle<PerformanceMetrics>,
}

impl ResourceMonitor {
    pub fn start() -> Self {
        let (stop, mut stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut system = System::new();
            let pid = sysinfo::get_current_pid().ok();

            // First CPU refresh only establishes the measurement baseline.
            system.refresh_cpu_usage();
            let disk_start = sample_disk(&mut system, pid);

            let mut cpu_total = 0.0f64;
            let mut mem_total = 0.0f64;
            let mut samples = 0u32;
            let mut disk_last = disk_start;

            let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        system.refresh_cpu_usage();
                        system.refresh_memory();
                        cpu_total += f64::from(system.global_cpu_usage());
                        mem_total += memory_percent(&system);
                        samples += 1;
                        disk_last = sample_disk(&mut system, pid);
                    }
                    _ = stopped.changed() => break,
                }
            }

            let divisor = f64::from(samples.max(1));
            PerformanceMetrics {
                avg_cpu_usage: round2(cpu_total / divisor),
                avg_memory_usage: round2(mem_total / divisor),
                disk_io_read: round2(to_mb(disk_last.0.saturating_sub(disk_start.0))),
                disk_io_write: round2(to_mb(disk_last.1.saturating_sub(disk_start.1))),
            }
        });
        ResourceMonitor { stop, task }
    }

    pub async fn stop(self) -> PerformanceMetrics {
        let _ = self.stop.send(true);
        self.task.await.unwrap_or_default()
    }
}

fn memory_percent(system: &System) -> f64 {
    let total = system.total_memory();
    if total == 0 {
        0.0
    } else {
        system.used_memory() as f64 / total as f64 * 100.0
    }
}

/// Cumulative (read, written) bytes for this process.
fn sample_disk(system: &mut System, pid: Option<Pid>) -> (u64, u64) {
    let Some(pid) = pid else { return (0, 0) };
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    match system.process(pid) {
        Some(process) => {
            let usage = process.disk_usage();
            (usage.total_read_bytes, usage.total_written_bytes)
        }
        None => (0, 0),
    }
}

fn to_mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Strategy;
    use std::time::Duration;

    fn snapshot(server: &str, served: u64, lost: u64, rating_sum: u64) -> MetricsSnapshot {
        MetricsSnapshot {
            server: server.to_string(),
            endpoint: "127.0.0.1:8000".to_string(),
            max_concurrency: 5,
            active_count: 0,
            admitted: served + lost,
            rejected: 0,
            served,
            lost,
            rating_sum,
            rating_count: served,
            current_client: None,
            elapsed: Duration::from_secs(10),
            busy: Duration::from_secs(5),
            service_time: Duration::from_secs(served),
        }
    }

    fn test_config() -> Config {
        Config {
            strategy: Strategy::Iterative,
            ..Config::default()
        }
    }

    #[test]
    fn test_build_derives_metrics() {
        let snapshots = vec![
            snapshot("Server_A", 6, 1, 30),
            snapshot("Server_B", 4, 1, 12),
        ];
        let report = RunReport::build(
            &test_config(),
            Duration::from_secs(5),
            &snapshots,
            PerformanceMetrics::default(),
        );

        assert_eq!(report.metrics.total_clients_served, 10);
        assert_eq!(report.metrics.total_lost_clients, 2);
        assert_eq!(report.metrics.throughput, 2.0);
        assert_eq!(report.metrics.average_rating, 4.2);
        assert_eq!(report.metrics.average_response_time, 1.0);
        assert_eq!(report.metrics.simulation_time, 5.0);
        assert_eq!(report.metrics.approach, "iterative");
        assert_eq!(report.status, RunStatus::Passed);
        assert_eq!(report.server_stats.len(), 2);
        assert_eq!(report.server_stats[0].clients_served, 6);
    }

    #[test]
    fn test_zero_served_is_failed() {
        let snapshots = vec![snapshot("Server_A", 0, 3, 0)];
        let report = RunReport::build(
            &test_config(),
            Duration::from_secs(5),
            &snapshots,
            PerformanceMetrics::default(),
        );
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.metrics.average_rating, 0.0);
    }

    #[test]
    fn test_artifact_shape() {
        let snapshots = vec![snapshot("Server_A", 2, 0, 10)];
        let report = RunReport::build(
            &test_config(),
            Duration::from_secs(2),
            &snapshots,
            PerformanceMetrics::default(),
        );

        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["status"], "PASSED");
        assert_eq!(value["metrics"]["approach"], "iterative");
        assert_eq!(value["metrics"]["total_clients_served"], 2);
        assert!(value["metrics"].get("average_response_time").is_some());
        assert!(value["performance_metrics"].get("avg_cpu_usage").is_some());
        assert!(value["server_stats"][0].get("server_name").is_some());
    }

    #[test]
    fn test_live_file_shape() {
        let live = LiveFile {
            metrics: LiveMetrics { throughput: 12.34 },
        };
        let value = serde_json::to_value(&live).unwrap();
        assert_eq!(value["metrics"]["throughput"], 12.34);
    }

    #[test]
    fn test_rounding() {
        assert_eq!(round2(1.006), 1.01);
        assert_eq!(round2(2.0 / 3.0), 0.67);
        assert_eq!(round4(1.0 / 3.0), 0.3333);
    }
}
