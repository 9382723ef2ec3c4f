//! Per-connection chat protocol: echo until the rating sentinel.
//!
//! Frames are newline-delimited text in both directions. A non-sentinel frame
//! is echoed back prefixed with `ECHO: `; the session ends when the client
//! sends `RATING:<n>`. Every read and write carries a bounded timeout so a
//! stalled peer is indistinguishable from a disconnected one.

use crate::session::SessionRecord;
use bytes::BytesMut;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

const ECHO_TAG: &str = "ECHO: ";

/// Session-ending frame prefix. The full frame is `RATING:<n>` with n in 1..=5.
pub const RATING_PREFIX: &str = "RATING:";

const LINE_CAPACITY: usize = 1024;

/// Runs the wire protocol for one accepted connection.
pub struct ChatHandler {
    server_name: String,
    read_timeout: Duration,
}

impl ChatHandler {
    pub fn new(server_name: impl Into<String>, read_timeout: Duration) -> Self {
        ChatHandler {
            server_name: server_name.into(),
            read_timeout,
        }
    }

    /// Drive `record` (already `Active`) to a terminal state. All transport
    /// and protocol failures are absorbed into the returned record; nothing
    /// propagates past this boundary.
    pub async fn run(&self, stream: TcpStream, mut record: SessionRecord) -> SessionRecord {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::with_capacity(LINE_CAPACITY);

        loop {
            line.clear();
            let n = match timeout(self.read_timeout, reader.read_line(&mut line)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    warn!(
                        server = %self.server_name,
                        client = %record.client(),
                        error = %e,
                        "Connection lost"
                    );
                    record.lose_connection(Instant::now());
                    return record;
                }
                Err(_) => {
                    warn!(
                        server = %self.server_name,
                        client = %record.client(),
                        "Read timed out, treating as disconnect"
                    );
                    record.lose_connection(Instant::now());
                    return record;
                }
            };

            if n == 0 {
                // EOF before the rating arrived
                debug!(
                    server = %self.server_name,
                    client = %record.client(),
                    "Client closed before rating"
                );
                record.lose_connection(Instant::now());
                return record;
            }

            let message = line.trim_end_matches(['\r', '\n']);

            if let Some(raw) = message.strip_prefix(RATING_PREFIX) {
                match raw.trim().parse::<u8>() {
                    Ok(rating) if (1..=5).contains(&rating) => {
                        debug!(
                            server = %self.server_name,
                            client = %record.client(),
                            rating,
                            "Session completed"
                        );
                        record.complete(rating, Instant::now());
                    }
                    _ => {
                        warn!(
                            server = %self.server_name,
                            client = %record.client(),
                            raw,
                            "Invalid rating"
                        );
                        record.lose_connection(Instant::now());
                    }
                }
                return record;
            }

            let mut reply = BytesMut::with_capacity(ECHO_TAG.len() + message.len() + 1);
            reply.extend_from_slice(ECHO_TAG.as_bytes());
            reply.extend_from_slice(message.as_bytes());
            reply.extend_from_slice(b"\n");

            match timeout(self.read_timeout, writer.write_all(&reply)).await {
                Ok(Ok(())) => record.record_message(),
                Ok(Err(e)) => {
                    warn!(
                        server = %self.server_name,
                        client = %record.client(),
                        error = %e,
                        "Echo write failed"
                    );
                    record.lose_connection(Instant::now());
                    return record;
                }
                Err(_) => {
                    warn!(
                        server = %self.server_name,
                        client = %record.client(),
                        "Echo write timed out"
                    );
                    record.lose_connection(Instant::now());
                    return record;
                }
            }
        }
    }
}
