//! Simulation harness.
//!
//! Drives virtual clients against a server pool, measures end-to-end
//! outcomes independently of the server-side records, and writes the result
//! artifact plus a periodically refreshed live-throughput file.

use crate::config::Config;
use crate::metrics::MetricsAggregator;
use crate::pool::{PoolError, PoolTotals, ServerPool};
use crate::protocol::RATING_PREFIX;
use crate::report::{write_live, ResourceMonitor, RunReport};
use rand::Rng;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{info, warn};

/// Clients are launched in batches of this size with a pause in between.
const CLIENT_BATCH: usize = 10;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(300);
const LIVE_WRITE_INTERVAL: Duration = Duration::from_secs(1);

/// External-collaborator seam: ratings for simulated clients.
pub fn generate_rating() -> u8 {
    rand::thread_rng().gen_range(1..=5)
}

/// Client-side view of one simulated session, recorded independently of the
/// server-side session record for cross-validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOutcome {
    pub served: bool,
    pub messages: u64,
    pub response_time: Duration,
}

impl ClientOutcome {
    fn lost() -> Self {
        ClientOutcome {
            served: false,
            messages: 0,
            response_time: Duration::ZERO,
        }
    }
}

#[derive(Debug)]
pub enum HarnessError {
    Pool(PoolError),
    Io(std::io::Error),
}

impl std::fmt::Display for HarnessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HarnessError::Pool(e) => write!(f, "Server pool failed to start: {e}"),
            HarnessError::Io(e) => write!(f, "Failed to write results: {e}"),
        }
    }
}

impl std::error::Error for HarnessError {}

struct ClientSpec {
    index: usize,
    addr: SocketAddr,
    rating: u8,
    messages: usize,
    read_timeout: Duration,
    connect_budget: Duration,
}

pub struct SimulationHarness {
    config: Config,
}

impl SimulationHarness {
    pub fn new(config: Config) -> Self {
        SimulationHarness { config }
    }

    /// Run the full simulation: start the pool, drive every virtual client,
    /// drain, snapshot, and write the result artifact.
    pub async fn run(&self) -> Result<RunReport, HarnessError> {
        info!(
            strategy = self.config.strategy.label(),
            servers = self.config.num_servers,
            clients = self.config.num_clients,
            duration_secs = self.config.duration_seconds,
            "Starting simulation"
        );

        let pool = ServerPool::start(&self.config)
            .await
            .map_err(HarnessError::Pool)?;

        let started = Instant::now();
        let monitor = ResourceMonitor::start();
        let (live_stop, live_stopped) = watch::channel(false);
        let live_task = tokio::spawn(live_writer(
            self.config.live_path(),
            pool.servers().iter().map(|s| s.metrics()).collect(),
            started,
            live_stopped,
        ));

        let mut tasks = Vec::with_capacity(self.config.num_clients);
        for index in 0..self.config.num_clients {
            if started.elapsed() >= self.config.duration() {
                warn!(launched = tasks.len(), "Duration elapsed during ramp-up");
                break;
            }
            let spec = ClientSpec {
                index,
                addr: pool.route(index).addr(),
                rating: self.config.fixed_rating.unwrap_or_else(generate_rating),
                messages: self.config.messages_per_client,
                read_timeout: self.config.read_timeout(),
                connect_budget: self.config.max_wait(),
            };
            tasks.push(tokio::spawn(run_client(spec)));
            if (index + 1) % CLIENT_BATCH == 0 {
                tokio::time::sleep(self.config.client_spacing()).await;
            }
        }

        let mut outcomes = Vec::with_capacity(tasks.len());
        for mut task in tasks {
            let remaining = self.config.duration().saturating_sub(started.elapsed());
            match timeout(remaining, &mut task).await {
                Ok(Ok(outcome)) => outcomes.push(outcome),
                Ok(Err(e)) => {
                    warn!(error = %e, "Client task failed");
                    outcomes.push(ClientOutcome::lost());
                }
                Err(_) => {
                    // Duration cap: abandon the straggler mid-session.
                    task.abort();
                    outcomes.push(ClientOutcome::lost());
                }
            }
        }
        let elapsed = started.elapsed();

        let snapshots = pool.shutdown().await;
        let _ = live_stop.send(true);
        let _ = live_task.await;
        let performance = monitor.stop().await;

        let report = RunReport::build(&self.config, elapsed, &snapshots, performance);
        write_live(&self.config.live_path(), report.metrics.throughput);
        report
            .write(&self.config.results_path())
            .map_err(HarnessError::Io)?;

        cross_validate(&outcomes, &PoolTotals::from_snapshots(&snapshots));
        log_summary(&report);
        Ok(report)
    }
}

/// The client and server sides count outcomes independently; a disagreement
/// points at an accounting bug rather than a lossy run.
fn cross_validate(outcomes: &[ClientOutcome], totals: &PoolTotals) {
    let client_served = outcomes.iter().filter(|o| o.served).count() as u64;
    let echoed: u64 = outcomes.iter().map(|o| o.messages).sum();
    let round_trips: Duration = outcomes.iter().map(|o| o.response_time).sum();
    let avg_round_trip_ms = round_trips.as_secs_f64() * 1000.0 / echoed.max(1) as f64;
    info!(
        client_served,
        echoed, avg_round_trip_ms, "Client-side totals"
    );

    if client_served != totals.served {
        warn!(
            client_served,
            server_served = totals.served,
            "Client-side and server-side served counts disagree"
        );
    }
    if totals.served + totals.lost != totals.admitted {
        warn!(
            admitted = totals.admitted,
            served = totals.served,
            lost = totals.lost,
            "Admitted sessions did not fully drain"
        );
    }
    if totals.rejected > 0 {
        warn!(rejected = totals.rejected, "Connections rejected by full queues");
    }
}

fn log_summary(report: &RunReport) {
    info!(
        approach = report.metrics.approach,
        served = report.metrics.total_clients_served,
        lost = report.metrics.total_lost_clients,
        throughput = report.metrics.throughput,
        average_rating = report.metrics.average_rating,
        simulation_time = report.metrics.simulation_time,
        utilization = report.metrics.server_utilization,
        status = ?report.status,
        "Simulation completed"
    );
    for stats in &report.server_stats {
        info!(
            server = %stats.server_name,
            served = stats.clients_served,
            lost = stats.lost_clients,
            average_rating = stats.average_rating,
            "Server breakdown"
        );
    }
}

/// One virtual client: connect (with retries inside the wait budget), send
/// the chat messages reading each echo, rate, disconnect.
async fn run_client(spec: ClientSpec) -> ClientOutcome {
    let client_id = format!("Client_{:04}", spec.index);

    let connect_started = Instant::now();
    let stream = loop {
        match timeout(CONNECT_TIMEOUT, TcpStream::connect(spec.addr)).await {
            Ok(Ok(stream)) => break stream,
            Ok(Err(_)) | Err(_) => {
                if connect_started.elapsed() + CONNECT_RETRY_DELAY >= spec.connect_budget {
                    warn!(client = %client_id, addr = %spec.addr, "Could not reach server");
                    return ClientOutcome::lost();
                }
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            }
        }
    };

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::with_capacity(256);
    let mut response_time = Duration::ZERO;
    let mut echoed = 0u64;

    let partial = |echoed, response_time| ClientOutcome {
        served: false,
        messages: echoed,
        response_time,
    };

    for n in 0..spec.messages {
        let frame = format!("{client_id} message {}\n", n + 1);
        let sent = Instant::now();
        if writer.write_all(frame.as_bytes()).await.is_err() {
            return partial(echoed, response_time);
        }
        line.clear();
        match timeout(spec.read_timeout, reader.read_line(&mut line)).await {
            Ok(Ok(len)) if len > 0 => {
                response_time += sent.elapsed();
                echoed += 1;
            }
            _ => return partial(echoed, response_time),
        }
    }

    let rating_frame = format!("{}{}\n", RATING_PREFIX, spec.rating);
    if writer.write_all(rating_frame.as_bytes()).await.is_err() {
        return partial(echoed, response_time);
    }
    // The server closes after the rating; waiting for its EOF confirms the
    // rating was consumed.
    line.clear();
    let _ = timeout(spec.read_timeout, reader.read_line(&mut line)).await;

    ClientOutcome {
        served: true,
        messages: echoed,
        response_time,
    }
}

async fn live_writer(
    path: PathBuf,
    metrics: Vec<Arc<MetricsAggregator>>,
    started: Instant,
    mut stopped: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(LIVE_WRITE_INTERVAL);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let served: u64 = metrics.iter().map(|m| m.snapshot().served).sum();
                let secs = started.elapsed().as_secs_f64();
                let throughput = if secs > 0.0 { served as f64 / secs } else { 0.0 };
                write_live(&path, throughput);
            }
            _ = stopped.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Strategy;
    use crate::report::RunStatus;

    #[test]
    fn test_generate_rating_range() {
        for _ in 0..100 {
            let rating = generate_rating();
            assert!((1..=5).contains(&rating));
        }
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("chatbench_{}_{}", std::process::id(), name))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_threading_simulation_end_to_end() {
        let results = temp_path("threading_results.json");
        let live = temp_path("threading_live.json");
        let config = Config {
            strategy: Strategy::Threading,
            num_servers: 2,
            num_clients: 6,
            base_port: 0,
            messages_per_client: 2,
            duration_seconds: 30,
            read_timeout_seconds: 2,
            client_spacing_ms: 0,
            fixed_rating: Some(5),
            results_file: Some(results.clone()),
            live_file: Some(live.clone()),
            ..Config::default()
        };

        let report = SimulationHarness::new(config).run().await.unwrap();

        assert_eq!(report.metrics.total_clients_served, 6);
        assert_eq!(report.metrics.total_lost_clients, 0);
        assert_eq!(report.metrics.average_rating, 5.0);
        assert_eq!(report.metrics.approach, "threading");
        assert_eq!(report.status, RunStatus::Passed);
        assert!(report.metrics.throughput > 0.0);

        // Index-modulo routing splits six clients three and three.
        assert_eq!(report.server_stats.len(), 2);
        assert_eq!(report.server_stats[0].clients_served, 3);
        assert_eq!(report.server_stats[1].clients_served, 3);

        let written = std::fs::read_to_string(&results).unwrap();
        let value: serde_json::Value = serde_json::from_str(&written).unwrap();
        assert_eq!(value["metrics"]["approach"], "threading");
        assert_eq!(value["status"], "PASSED");
        let live_written = std::fs::read_to_string(&live).unwrap();
        let live_value: serde_json::Value = serde_json::from_str(&live_written).unwrap();
        assert!(live_value["metrics"]["throughput"].is_number());

        let _ = std::fs::remove_file(&results);
        let _ = std::fs::remove_file(&live);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_iterative_simulation_serves_all() {
        let results = temp_path("iterative_results.json");
        let live = temp_path("iterative_live.json");
        let config = Config {
            strategy: Strategy::Iterative,
            num_servers: 1,
            num_clients: 3,
            max_concurrency: 1,
            base_port: 0,
            messages_per_client: 1,
            duration_seconds: 30,
            read_timeout_seconds: 2,
            client_spacing_ms: 0,
            fixed_rating: Some(4),
            results_file: Some(results.clone()),
            live_file: Some(live.clone()),
            ..Config::default()
        };

        let report = SimulationHarness::new(config).run().await.unwrap();
        assert_eq!(report.metrics.total_clients_served, 3);
        assert_eq!(report.metrics.total_lost_clients, 0);
        assert_eq!(report.metrics.average_rating, 4.0);
        assert_eq!(report.metrics.approach, "iterative");

        let _ = std::fs::remove_file(&results);
        let _ = std::fs::remove_file(&live);
    }
}
