//! Logical chat server.
//!
//! Each server owns one listening endpoint, one admission queue, one
//! dispatcher, and one metrics slice. Accepted connections are stamped with
//! their arrival time and queued; the dispatcher applies the wait-time
//! policy and runs the chat protocol under the configured strategy.
//!
//! A bind failure is fatal to this server only; sibling servers in the pool
//! keep running.

use crate::archive;
use crate::config::Config;
use crate::dispatch::{DispatchPolicy, PendingConn, WorkerDispatcher, POLL_INTERVAL};
use crate::metrics::{MetricsAggregator, MetricsSnapshot};
use crate::queue::{AdmissionQueue, EnqueueError};
use crate::session::SessionRecord;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

const LISTEN_BACKLOG: i32 = 100;
const RECORD_CHANNEL_DEPTH: usize = 256;

/// The listening endpoint could not be acquired.
#[derive(Debug)]
pub struct BindError {
    pub server: String,
    pub addr: String,
    pub source: std::io::Error,
}

impl std::fmt::Display for BindError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} failed to bind {}: {}",
            self.server, self.addr, self.source
        )
    }
}

impl std::error::Error for BindError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// A configured-but-not-yet-started server.
pub struct LogicalServer {
    index: usize,
    name: String,
    config: Config,
}

impl LogicalServer {
    pub fn new(index: usize, config: Config) -> Self {
        LogicalServer {
            index,
            name: Config::server_name(index),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bind the endpoint and spawn the accept loop, dispatcher, and
    /// aggregation task.
    pub async fn start(self) -> Result<RunningServer, BindError> {
        let LogicalServer {
            index,
            name,
            config,
        } = self;

        let requested = format!("{}:{}", config.host, config.port_for(index));
        let addr: SocketAddr = requested.parse().map_err(|e| BindError {
            server: name.clone(),
            addr: requested.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
        })?;

        let listener = bind_listener(addr).map_err(|source| BindError {
            server: name.clone(),
            addr: requested.clone(),
            source,
        })?;
        let addr = listener.local_addr().map_err(|source| BindError {
            server: name.clone(),
            addr: requested.clone(),
            source,
        })?;
        info!(server = %name, addr = %addr, "Server listening");

        let metrics = MetricsAggregator::new(&name, addr.to_string(), config.max_concurrency);
        let queue = Arc::new(AdmissionQueue::new(config.queue_bound()));
        let (records_tx, records_rx) = mpsc::channel(RECORD_CHANNEL_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&queue),
            Arc::clone(&metrics),
            shutdown_rx,
            name.clone(),
        ));

        let dispatcher = WorkerDispatcher::new(
            index,
            &name,
            DispatchPolicy::from_config(&config),
            Arc::clone(&queue),
            Arc::clone(&metrics),
            records_tx,
        );
        let dispatch_task = tokio::spawn(dispatcher.run());

        let aggregate_task = tokio::spawn(aggregate_loop(
            records_rx,
            Arc::clone(&metrics),
            name.clone(),
        ));

        Ok(RunningServer {
            index,
            name,
            addr,
            metrics,
            queue,
            shutdown: shutdown_tx,
            accept_task,
            dispatch_task,
            aggregate_task,
        })
    }
}

/// A started server and its background tasks.
pub struct RunningServer {
    index: usize,
    name: String,
    addr: SocketAddr,
    metrics: Arc<MetricsAggregator>,
    queue: Arc<AdmissionQueue<PendingConn>>,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    dispatch_task: JoinHandle<()>,
    aggregate_task: JoinHandle<()>,
}

impl RunningServer {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Actual bound address (relevant when the config requested port 0).
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn metrics(&self) -> Arc<MetricsAggregator> {
        Arc::clone(&self.metrics)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Cooperative shutdown: stop accepting, close the queue, let the
    /// dispatcher drain in-flight sessions, then join all tasks. After this
    /// returns, `served + lost == admitted` holds for this server.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        self.queue.close();
        let _ = self.accept_task.await;
        let _ = self.dispatch_task.await;
        let _ = self.aggregate_task.await;
        info!(server = %self.name, "Server stopped");
    }
}

/// Listener construction mirrors the original socket options: address reuse
/// and a backlog of 100.
fn bind_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

async fn accept_loop(
    listener: TcpListener,
    queue: Arc<AdmissionQueue<PendingConn>>,
    metrics: Arc<MetricsAggregator>,
    shutdown: watch::Receiver<bool>,
    name: String,
) {
    while !*shutdown.borrow() {
        match timeout(POLL_INTERVAL, listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                let client = format!("Client-{}", peer.port());
                debug!(server = %name, peer = %peer, "Client approached");
                let pending = PendingConn { stream, client };
                match queue.enqueue(pending, Instant::now()) {
                    Ok(()) => metrics.record_admitted(),
                    Err(EnqueueError::Full) => {
                        warn!(server = %name, peer = %peer, "Queue full, rejecting client");
                        metrics.record_rejected();
                    }
                    Err(EnqueueError::Closed) => break,
                }
            }
            Ok(Err(e)) => {
                error!(server = %name, error = %e, "Failed to accept connection");
            }
            // Poll the shutdown flag again.
            Err(_) => continue,
        }
    }
    debug!(server = %name, "Accept loop stopped");
}

/// Single aggregating task per server: every terminal record, from any
/// strategy, lands here and nowhere else.
async fn aggregate_loop(
    mut records: mpsc::Receiver<SessionRecord>,
    metrics: Arc<MetricsAggregator>,
    name: String,
) {
    while let Some(record) = records.recv().await {
        debug!(
            server = %name,
            client = %record.client(),
            status = record.status().as_str(),
            "Session finished"
        );
        let client = record.client().to_string();
        let rating = record.rating();
        metrics.record(record);
        archive::log_session(&name, &client, rating);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Strategy;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn test_config(strategy: Strategy) -> Config {
        Config {
            strategy,
            num_servers: 1,
            base_port: 0,
            read_timeout_seconds: 2,
            ..Config::default()
        }
    }

    async fn chat(addr: SocketAddr, rating: u8, think: Duration) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"hello\n").await.unwrap();
        let mut buf = [0u8; 32];
        let n = stream.read(&mut buf).await.unwrap();
        assert!(buf[..n].starts_with(b"ECHO: "));
        tokio::time::sleep(think).await;
        stream
            .write_all(format!("RATING:{rating}\n").as_bytes())
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_serves_clients_end_to_end() {
        let server = LogicalServer::new(0, test_config(Strategy::Threading));
        let running = server.start().await.unwrap();
        let addr = running.addr();
        let metrics = running.metrics();

        let a = tokio::spawn(chat(addr, 4, Duration::ZERO));
        let b = tokio::spawn(chat(addr, 2, Duration::ZERO));
        a.await.unwrap();
        b.await.unwrap();

        // Give the handlers a moment to observe the client-side close.
        tokio::time::sleep(Duration::from_millis(100)).await;
        running.shutdown().await;

        let snap = metrics.snapshot();
        assert_eq!(snap.admitted, 2);
        assert_eq!(snap.served, 2);
        assert_eq!(snap.lost, 0);
        assert_eq!(snap.rating_sum, 6);
        assert_eq!(snap.rating_count, 2);
        assert_eq!(snap.served + snap.lost, snap.admitted);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sequential_strategy_serializes_sessions() {
        let mut config = test_config(Strategy::Iterative);
        config.max_concurrency = 1;
        let running = LogicalServer::new(0, config).start().await.unwrap();
        let addr = running.addr();
        let metrics = running.metrics();

        // Three simultaneous clients, each holding its session ~200ms. The
        // echo round-trip only completes once a session is active, so the
        // joined wall-clock shows the serialization.
        let started = Instant::now();
        let think = Duration::from_millis(200);
        let (a, b, c) = tokio::join!(
            tokio::spawn(chat(addr, 5, think)),
            tokio::spawn(chat(addr, 5, think)),
            tokio::spawn(chat(addr, 5, think)),
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();
        let elapsed = started.elapsed();

        tokio::time::sleep(Duration::from_millis(100)).await;
        running.shutdown().await;

        let snap = metrics.snapshot();
        assert_eq!(snap.served, 3);
        assert_eq!(snap.lost, 0);
        assert_eq!(snap.average_rating(), 5.0);
        assert!(
            elapsed >= Duration::from_millis(500),
            "sessions overlapped: {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn test_disconnect_counts_as_lost() {
        let running = LogicalServer::new(0, test_config(Strategy::Threading))
            .start()
            .await
            .unwrap();
        let addr = running.addr();
        let metrics = running.metrics();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"hello\n").await.unwrap();
        let mut buf = [0u8; 32];
        stream.read(&mut buf).await.unwrap();
        drop(stream);

        tokio::time::sleep(Duration::from_millis(100)).await;
        running.shutdown().await;

        let snap = metrics.snapshot();
        assert_eq!(snap.served, 0);
        assert_eq!(snap.lost, 1);
        assert_eq!(snap.rating_count, 0);
    }

    #[tokio::test]
    async fn test_bind_failure_is_surfaced() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let mut config = test_config(Strategy::Threading);
        config.base_port = port;
        let result = LogicalServer::new(0, config).start().await;
        let err = result.err().expect("bind should fail");
        assert_eq!(err.server, "Server_A");
        assert!(err.to_string().contains("failed to bind"));
    }
}
