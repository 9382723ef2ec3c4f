//! Server pool.
//!
//! Owns the logical servers, routes virtual clients to them with a stable
//! index-modulo rule, and aggregates pool-wide totals. A server that fails
//! to bind is reported and left out; the rest of the pool keeps running.

use crate::config::Config;
use crate::metrics::MetricsSnapshot;
use crate::server::{BindError, LogicalServer, RunningServer};
use std::time::Duration;
use tracing::{error, info};

/// Not a single server in the pool could start.
#[derive(Debug)]
pub struct PoolError {
    pub failures: Vec<BindError>,
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "no server could start ({} bind failures)", self.failures.len())
    }
}

impl std::error::Error for PoolError {}

pub struct ServerPool {
    servers: Vec<RunningServer>,
    failures: Vec<BindError>,
}

impl ServerPool {
    /// Start `config.num_servers` servers on `base_port + index`. Bind
    /// failures are collected per server; the pool errors only when nothing
    /// started at all.
    pub async fn start(config: &Config) -> Result<ServerPool, PoolError> {
        let mut servers = Vec::new();
        let mut failures = Vec::new();

        for index in 0..config.num_servers {
            match LogicalServer::new(index, config.clone()).start().await {
                Ok(running) => servers.push(running),
                Err(e) => {
                    error!(error = %e, "Server failed to start");
                    failures.push(e);
                }
            }
        }

        if servers.is_empty() {
            return Err(PoolError { failures });
        }
        info!(
            started = servers.len(),
            failed = failures.len(),
            "Server pool started"
        );
        Ok(ServerPool { servers, failures })
    }

    pub fn servers(&self) -> &[RunningServer] {
        &self.servers
    }

    pub fn failures(&self) -> &[BindError] {
        &self.failures
    }

    /// Deterministic routing: client `index` always lands on the same
    /// server, so repeated runs with the same client population reproduce
    /// the same assignment.
    pub fn route(&self, client_index: usize) -> &RunningServer {
        &self.servers[client_index % self.servers.len()]
    }

    pub fn snapshots(&self) -> Vec<MetricsSnapshot> {
        self.servers.iter().map(|s| s.snapshot()).collect()
    }

    /// Shut every server down cooperatively and return the final,
    /// fully-drained snapshots.
    pub async fn shutdown(self) -> Vec<MetricsSnapshot> {
        let metrics: Vec<_> = self.servers.iter().map(|s| s.metrics()).collect();
        for server in self.servers {
            server.shutdown().await;
        }
        metrics.iter().map(|m| m.snapshot()).collect()
    }
}

/// Pool-wide sums over a set of server snapshots.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PoolTotals {
    pub servers: usize,
    pub admitted: u64,
    pub rejected: u64,
    pub served: u64,
    pub lost: u64,
    pub rating_sum: u64,
    pub rating_count: u64,
    pub service_time: Duration,
}

impl PoolTotals {
    pub fn from_snapshots(snapshots: &[MetricsSnapshot]) -> Self {
        let mut totals = PoolTotals {
            servers: snapshots.len(),
            ..PoolTotals::default()
        };
        for snap in snapshots {
            totals.admitted += snap.admitted;
            totals.rejected += snap.rejected;
            totals.served += snap.served;
            totals.lost += snap.lost;
            totals.rating_sum += snap.rating_sum;
            totals.rating_count += snap.rating_count;
            totals.service_time += snap.service_time;
        }
        totals
    }

    pub fn average_rating(&self) -> f64 {
        if self.rating_count == 0 {
            0.0
        } else {
            self.rating_sum as f64 / self.rating_count as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Strategy;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn test_config(num_servers: usize) -> Config {
        Config {
            strategy: Strategy::Threading,
            num_servers,
            base_port: 0,
            read_timeout_seconds: 2,
            ..Config::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_modulo_routing_is_deterministic() {
        let pool = ServerPool::start(&test_config(2)).await.unwrap();

        // Ten clients split even/odd across the two servers.
        for i in 0..10 {
            assert_eq!(pool.route(i).index(), i % 2);
        }
        assert_eq!(pool.route(4).name(), "Server_A");
        assert_eq!(pool.route(7).name(), "Server_B");

        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_totals_aggregate_servers() {
        let pool = ServerPool::start(&test_config(2)).await.unwrap();

        for i in 0..4 {
            let addr = pool.route(i).addr();
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"hi\n").await.unwrap();
            let mut buf = [0u8; 32];
            stream.read(&mut buf).await.unwrap();
            stream.write_all(b"RATING:5\n").await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        let snapshots = pool.shutdown().await;
        let totals = PoolTotals::from_snapshots(&snapshots);

        assert_eq!(totals.servers, 2);
        assert_eq!(totals.served, 4);
        assert_eq!(totals.lost, 0);
        assert_eq!(totals.average_rating(), 5.0);
        // Even split under index-modulo routing.
        assert_eq!(snapshots[0].served, 2);
        assert_eq!(snapshots[1].served, 2);
    }

    #[tokio::test]
    async fn test_bind_failure_leaves_siblings_running() {
        // Occupy what will become Server_A's port; Server_B's should be free.
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let mut config = test_config(2);
        config.base_port = port;
        let pool = ServerPool::start(&config).await.unwrap();

        assert_eq!(pool.servers().len(), 1);
        assert_eq!(pool.failures().len(), 1);
        assert_eq!(pool.failures()[0].server, "Server_A");
        assert_eq!(pool.servers()[0].name(), "Server_B");

        pool.shutdown().await;
    }
}
