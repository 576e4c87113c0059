//! Follows `svlogd` output files the way `tail -qF` does.
//!
//! Each file is polled by its own task; lines from every file are merged into
//! one channel in arrival order.

use std::io::{self, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Lines printed from each file before following it.
pub const INITIAL_LINES: usize = 10;
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

// Window read from the end of a file to find its last lines.
const BACKLOG_WINDOW: u64 = 64 * 1024;

/// Handle to a running set of followers. Dropping it stops them.
pub struct Tail {
    lines: mpsc::Receiver<String>,
    tasks: Vec<JoinHandle<()>>,
}

impl Tail {
    /// Starts following `paths`, polling every `interval`.
    pub fn follow(paths: Vec<PathBuf>, interval: Duration) -> Self {
        let (tx, lines) = mpsc::channel(1024);
        let tasks = paths
            .into_iter()
            .map(|path| {
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = follow_file(&path, interval, tx).await {
                        warn!(path = %path.display(), error = %err, "stopped following log");
                    }
                })
            })
            .collect();
        Self { lines, tasks }
    }

    /// Next line from any followed file; `None` once every follower ended.
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }
}

impl Drop for Tail {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct Cursor {
    inode: u64,
    offset: u64,
    pending: Vec<u8>,
}

async fn follow_file(path: &Path, interval: Duration, tx: mpsc::Sender<String>) -> io::Result<()> {
    let mut cursor: Option<Cursor> = None;
    // Only a file present at startup is trimmed to its last lines.
    let mut backlog_only = true;
    loop {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => Some(metadata),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => return Err(err),
        };
        if let Some(metadata) = metadata {
            let inode = metadata.ino();
            let len = metadata.len();
            let rotated = cursor
                .as_ref()
                .is_some_and(|current| current.inode != inode || len < current.offset);
            if rotated {
                debug!(path = %path.display(), "log rotated, reopening");
                cursor = None;
            }
            let current = match cursor.take() {
                Some(current) => current,
                None if backlog_only => read_backlog(path, inode, len).await?,
                None => Cursor { inode, offset: 0, pending: Vec::new() },
            };
            let current = cursor.insert(current);
            let lines = read_appended(path, current, len).await?;
            for line in lines {
                if tx.send(line).await.is_err() {
                    return Ok(());
                }
            }
        } else if cursor.take().is_some() {
            debug!(path = %path.display(), "log disappeared, waiting for it");
        }
        backlog_only = false;
        if tx.is_closed() {
            return Ok(());
        }
        tokio::time::sleep(interval).await;
    }
}

// Positions a new cursor so the next read yields at most the last
// `INITIAL_LINES` lines of the file.
async fn read_backlog(path: &Path, inode: u64, len: u64) -> io::Result<Cursor> {
    let start = len.saturating_sub(BACKLOG_WINDOW);
    let mut cursor = Cursor { inode, offset: start, pending: Vec::new() };
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(start)).await?;
    let mut window = Vec::new();
    file.take(len - start).read_to_end(&mut window).await?;
    // Ignore a trailing newline so it is not counted as an empty line.
    let body = window.strip_suffix(b"\n").unwrap_or(&window[..]);
    let newlines: Vec<usize> = body
        .iter()
        .enumerate()
        .filter(|(_, byte)| **byte == b'\n')
        .map(|(index, _)| index)
        .collect();
    if newlines.len() >= INITIAL_LINES {
        cursor.offset = start + newlines[newlines.len() - INITIAL_LINES] as u64 + 1;
    } else if start > 0 {
        // The window began mid-line; skip to the first full line.
        cursor.offset = start + newlines.first().map_or(window.len() as u64, |index| *index as u64 + 1);
    }
    Ok(cursor)
}

async fn read_appended(path: &Path, cursor: &mut Cursor, len: u64) -> io::Result<Vec<String>> {
    if len <= cursor.offset {
        return Ok(Vec::new());
    }
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(cursor.offset)).await?;
    let mut chunk = Vec::new();
    let read = file.read_to_end(&mut chunk).await?;
    cursor.offset += read as u64;
    Ok(split_lines(&mut cursor.pending, &chunk))
}

/// Appends `chunk` to `pending` and drains every complete line.
pub fn split_lines(pending: &mut Vec<u8>, chunk: &[u8]) -> Vec<String> {
    pending.extend_from_slice(chunk);
    let Some(last_newline) = pending.iter().rposition(|byte| *byte == b'\n') else {
        return Vec::new();
    };
    let rest = pending.split_off(last_newline + 1);
    let complete = std::mem::replace(pending, rest);
    complete[..complete.len() - 1]
        .split(|byte| *byte == b'\n')
        .map(|line| String::from_utf8_lossy(line).into_owned())
        .collect()
}
