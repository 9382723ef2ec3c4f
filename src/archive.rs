//! Archival session log.
//!
//! The archive writer proper is an external collaborator; this module is the
//! seam the core calls through. One line is appended per terminal session.
//! Archival failures are logged and swallowed so they can never change a
//! session's outcome.

use chrono::Local;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::warn;

const ARCHIVE_FILE: &str = "archive.txt";

/// Append one session entry to the archive file. `rating = None` records a
/// lost client.
pub fn log_session(server: &str, client: &str, rating: Option<u8>) {
    if let Err(e) = append(Path::new(ARCHIVE_FILE), server, client, rating) {
        warn!(error = %e, server, client, "Failed to archive session");
    }
}

fn append(path: &Path, server: &str, client: &str, rating: Option<u8>) -> std::io::Result<()> {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
    let status = match rating {
        Some(r) => format!("Rating: {r}"),
        None => "LOST".to_string(),
    };
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(
        file,
        "[{timestamp}] Server: {server}, Client: {client}, {status}"
    )
}
