//! Connection dispatch under three interchangeable concurrency strategies.
//!
//! All strategies share one loop: dequeue from the admission queue, apply the
//! wait-time policy, then run the chat protocol without ever exceeding the
//! server's concurrency cap.
//!
//! - `iterative`: one connection at a time, processed inline.
//! - `threading`: one spawned task per connection, capped by a semaphore.
//! - `forking`: one OS process per connection; the accepted socket fd is
//!   inherited by a re-exec of the current binary and the terminal outcome
//!   comes back as a single JSON line on the child's stdout.
//!
//! Terminal records from every strategy flow over the server's mpsc channel
//! to its aggregating task. Per-connection failures never abort the loop.

use crate::config::{Config, Strategy};
use crate::metrics::MetricsAggregator;
use crate::protocol::ChatHandler;
use crate::queue::{AdmissionQueue, Dequeue};
use crate::session::{SessionRecord, SessionStatus};
use serde::{Deserialize, Serialize};
use std::os::fd::AsRawFd;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Bounded wait used at every blocking point so shutdown latency stays small.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Hard cap on one forked child's lifetime. The protocol's read timeout
/// bounds idle gaps, so only a wedged child ever hits this.
const CHILD_SESSION_CAP: Duration = Duration::from_secs(600);

/// An accepted connection waiting for dispatch.
pub struct PendingConn {
    pub stream: TcpStream,
    pub client: String,
}

/// Dispatch knobs shared by all strategies.
#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    pub strategy: Strategy,
    pub max_concurrency: usize,
    pub max_wait: Duration,
    pub read_timeout: Duration,
    pub child_grace: Duration,
}

impl DispatchPolicy {
    pub fn from_config(config: &Config) -> Self {
        DispatchPolicy {
            strategy: config.strategy,
            max_concurrency: config.max_concurrency,
            max_wait: config.max_wait(),
            read_timeout: config.read_timeout(),
            child_grace: config.child_grace(),
        }
    }
}

/// Drains one server's admission queue under the configured strategy.
pub struct WorkerDispatcher {
    server_index: usize,
    server_name: String,
    policy: DispatchPolicy,
    queue: Arc<AdmissionQueue<PendingConn>>,
    metrics: Arc<MetricsAggregator>,
    records: mpsc::Sender<SessionRecord>,
    permits: Arc<Semaphore>,
    cap: u32,
}

impl WorkerDispatcher {
    pub fn new(
        server_index: usize,
        server_name: impl Into<String>,
        policy: DispatchPolicy,
        queue: Arc<AdmissionQueue<PendingConn>>,
        metrics: Arc<MetricsAggregator>,
        records: mpsc::Sender<SessionRecord>,
    ) -> Self {
        // Sequential processing is capped at one by construction.
        let cap = match policy.strategy {
            Strategy::Iterative => 1,
            Strategy::Threading | Strategy::Forking => policy.max_concurrency.max(1),
        };
        WorkerDispatcher {
            server_index,
            server_name: server_name.into(),
            policy,
            queue,
            metrics,
            records,
            permits: Arc::new(Semaphore::new(cap)),
            cap: cap as u32,
        }
    }

    /// Run until the queue is closed and drained, then wait for in-flight
    /// handlers to finish.
    pub async fn run(self) {
        match self.policy.strategy {
            Strategy::Iterative => self.run_sequential().await,
            Strategy::Threading => self.run_concurrent(false).await,
            Strategy::Forking => self.run_concurrent(true).await,
        }
    }

    async fn run_sequential(self) {
        let handler = ChatHandler::new(&self.server_name, self.policy.read_timeout);
        loop {
            match self.queue.dequeue(POLL_INTERVAL).await {
                Dequeue::Item(conn, arrival) => {
                    let Some(record) = self.admit(&conn.client, arrival).await else {
                        drop(conn);
                        continue;
                    };
                    let guard = self.metrics.begin_active(record.client());
                    let record = handler.run(conn.stream, record).await;
                    drop(guard);
                    self.report(record).await;
                }
                Dequeue::TimedOut => continue,
                Dequeue::Closed => break,
            }
        }
    }

    /// Shared loop for the threading and forking strategies: a semaphore
    /// permit is taken before the dequeue so a full house leaves items
    /// queued (their wait time keeps accruing toward the eviction policy).
    async fn run_concurrent(self, forking: bool) {
        loop {
            let permit = match timeout(
                POLL_INTERVAL,
                Arc::clone(&self.permits).acquire_owned(),
            )
            .await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => break,
                Err(_) => {
                    if self.queue.is_closed() && self.queue.is_empty() {
                        break;
                    }
                    continue;
                }
            };

            match self.queue.dequeue(POLL_INTERVAL).await {
                Dequeue::Item(conn, arrival) => {
                    let Some(record) = self.admit(&conn.client, arrival).await else {
                        drop(conn);
                        drop(permit);
                        continue;
                    };
                    let server_name = self.server_name.clone();
                    let policy = self.policy.clone();
                    let metrics = Arc::clone(&self.metrics);
                    let records = self.records.clone();
                    tokio::spawn(async move {
                        let guard = metrics.begin_active(record.client());
                        let record = if forking {
                            serve_in_child(&server_name, &policy, conn, record).await
                        } else {
                            let handler = ChatHandler::new(&server_name, policy.read_timeout);
                            handler.run(conn.stream, record).await
                        };
                        drop(guard);
                        if records.send(record).await.is_err() {
                            warn!(server = %server_name, "Record channel closed");
                        }
                        drop(permit);
                    });
                }
                Dequeue::TimedOut => drop(permit),
                Dequeue::Closed => {
                    drop(permit);
                    break;
                }
            }
        }

        // In-flight handlers hold permits; reclaiming all of them means the
        // last one has reported.
        let _ = self.permits.acquire_many(self.cap).await;
    }

    /// Apply the wait-time policy at dequeue. Returns the activated record,
    /// or reports a timeout-lost session and returns None; the caller closes
    /// the connection without running the protocol.
    async fn admit(&self, client: &str, arrival: Instant) -> Option<SessionRecord> {
        let mut record = SessionRecord::new(client, self.server_index, arrival);
        let now = Instant::now();
        if record.queued_for(now) > self.policy.max_wait {
            warn!(
                server = %self.server_name,
                client,
                waited_secs = record.queued_for(now).as_secs(),
                "Client waited too long, marked as lost"
            );
            record.lose_to_timeout(now);
            self.report(record).await;
            return None;
        }
        record.activate(now);
        debug!(server = %self.server_name, client, "Serving client");
        Some(record)
    }

    async fn report(&self, record: SessionRecord) {
        if self.records.send(record).await.is_err() {
            warn!(server = %self.server_name, "Record channel closed");
        }
    }
}

/// Terminal outcome carried from a forked child back to its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChildOutcome {
    Completed,
    ConnectionLost,
}

/// One JSON line on the child's stdout. Process memory is not shared, so
/// this is the only channel a child reports through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildReport {
    pub outcome: ChildOutcome,
    pub rating: Option<u8>,
    pub messages: u64,
}

impl ChildReport {
    pub fn from_record(record: &SessionRecord) -> Self {
        let outcome = match record.status() {
            SessionStatus::Completed => ChildOutcome::Completed,
            _ => ChildOutcome::ConnectionLost,
        };
        ChildReport {
            outcome,
            rating: record.rating(),
            messages: record.messages(),
        }
    }

    /// Fold the report into the parent-side record.
    pub fn apply(self, mut record: SessionRecord) -> SessionRecord {
        let now = Instant::now();
        record.record_messages(self.messages);
        match (self.outcome, self.rating) {
            (ChildOutcome::Completed, Some(rating)) if (1..=5).contains(&rating) => {
                record.complete(rating, now);
            }
            _ => record.lose_connection(now),
        }
        record
    }
}

/// Hand the connection to a freshly spawned process and wait for its report.
/// Every failure mode degrades to a lost session; the dispatcher loop never
/// sees an error.
async fn serve_in_child(
    server_name: &str,
    policy: &DispatchPolicy,
    conn: PendingConn,
    mut record: SessionRecord,
) -> SessionRecord {
    let std_stream = match conn.stream.into_std() {
        Ok(stream) => stream,
        Err(e) => {
            warn!(server = %server_name, error = %e, "Failed to detach connection");
            record.lose_connection(Instant::now());
            return record;
        }
    };

    let fd = std_stream.as_raw_fd();
    // The fd must survive exec for the child to inherit it.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, 0) } == -1 {
        warn!(server = %server_name, "Failed to clear FD_CLOEXEC on connection");
        record.lose_connection(Instant::now());
        return record;
    }

    let exe = match std::env::current_exe() {
        Ok(path) => path,
        Err(e) => {
            warn!(server = %server_name, error = %e, "Cannot locate own binary");
            record.lose_connection(Instant::now());
            return record;
        }
    };

    let mut child = match child_command(&exe, fd, server_name, record.client(), policy.read_timeout)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            warn!(
                server = %server_name,
                client = %record.client(),
                error = %e,
                "Failed to spawn connection process"
            );
            record.lose_connection(Instant::now());
            return record;
        }
    };
    // The child holds its inherited copy now; release ours.
    drop(std_stream);

    let report = read_report(&mut child, server_name).await;
    reap(child, policy.child_grace, server_name).await;

    match report {
        Some(report) => report.apply(record),
        None => {
            record.lose_connection(Instant::now());
            record
        }
    }
}

fn child_command(
    exe: &std::path::Path,
    fd: i32,
    server_name: &str,
    client: &str,
    read_timeout: Duration,
) -> Command {
    let mut command = Command::new(exe);
    command
        .arg("--child-fd")
        .arg(fd.to_string())
        .arg("--child-server")
        .arg(server_name)
        .arg("--child-client")
        .arg(client)
        .arg("--child-read-timeout")
        .arg(read_timeout.as_secs().to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    command
}

async fn read_report(child: &mut Child, server_name: &str) -> Option<ChildReport> {
    let stdout = child.stdout.take()?;
    let mut reader = BufReader::new(stdout);
    let mut line = String::new();
    match timeout(CHILD_SESSION_CAP, reader.read_line(&mut line)).await {
        Ok(Ok(0)) => {
            debug!(server = %server_name, "Child exited without a report");
            None
        }
        Ok(Ok(_)) => match serde_json::from_str(&line) {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(server = %server_name, error = %e, "Malformed child report");
                None
            }
        },
        Ok(Err(e)) => {
            warn!(server = %server_name, error = %e, "Failed to read child report");
            None
        }
        Err(_) => {
            warn!(server = %server_name, "Child exceeded session cap");
            None
        }
    }
}

/// Join the child, killing it after the grace period if it hangs.
async fn reap(mut child: Child, grace: Duration, server_name: &str) {
    match timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            if !status.success() {
                debug!(server = %server_name, %status, "Child exited abnormally");
            }
        }
        Ok(Err(e)) => warn!(server = %server_name, error = %e, "Failed to join child"),
        Err(_) => {
            warn!(server = %server_name, "Child unresponsive past grace period, killing");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

/// Entry point for the forked-strategy child process: adopt the inherited
/// connection fd, run the protocol on a current-thread runtime, and print
/// one JSON report line to stdout.
pub fn run_child(
    fd: i32,
    server_name: &str,
    client: &str,
    read_timeout: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    use std::io::Write;
    use std::os::fd::FromRawFd;

    // Safety: the parent transferred sole ownership of this fd via exec.
    let std_stream = unsafe { std::net::TcpStream::from_raw_fd(fd) };
    std_stream.set_nonblocking(true)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let report = runtime.block_on(async move {
        let stream = TcpStream::from_std(std_stream)?;
        let now = Instant::now();
        let mut record = SessionRecord::new(client, 0, now);
        record.activate(now);
        let handler = ChatHandler::new(server_name, read_timeout);
        let record = handler.run(stream, record).await;
        Ok::<_, std::io::Error>(ChildReport::from_record(&record))
    })?;

    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer(&mut stdout, &report)?;
    writeln!(stdout)?;
    Ok(())
}
