//! Follow one growing log file.
//!
//! A [`TailSession`] owns the file and one background reader task. Reading
//! starts at the end of file as it was when the session opened, so only
//! future growth is delivered. Each tick the reader compares the file length
//! with its offset, reads the new complete lines and sends them as a
//! [`LogBatch`] to the slot's channel.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::TailError;
use crate::polling::LinearPollingInterval;

/// Default reader tick.
pub const TAIL_TICK: Duration = Duration::from_millis(100);

/// Consecutive read failures between repeated warnings.
const READ_FAILURE_WARN_EVERY: u64 = 600;

/// Warn on the first failure of a streak, then every
/// [`READ_FAILURE_WARN_EVERY`] failures.
fn should_warn_read_failure(consecutive: u64) -> bool {
    consecutive == 1 || consecutive % READ_FAILURE_WARN_EVERY == 0
}

/// Lines read in one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogBatch {
    /// Set on the first batch of a session opened as a new session.
    pub is_new_session: bool,
    /// Characters across all lines, excluding line terminators.
    pub total_chars: usize,
    pub lines: Vec<String>,
}

impl LogBatch {
    #[must_use]
    pub fn new(is_new_session: bool, lines: Vec<String>) -> Self {
        let total_chars = lines.iter().map(|l| l.chars().count()).sum();
        Self {
            is_new_session,
            total_chars,
            lines,
        }
    }
}

/// Reader state owned by the background task.
struct Reader {
    path: PathBuf,
    file: File,
    offset: u64,
    is_new_session: bool,
    pending: Option<LogBatch>,
}

impl Reader {
    /// New complete lines since the last call, or `None` when the file did
    /// not grow.
    async fn poll(&mut self) -> std::io::Result<Option<Vec<String>>> {
        let len = self.file.metadata().await?.len();
        if len < self.offset {
            debug!(path = %self.path.display(), old = self.offset, new = len, "log file truncated");
            self.offset = len;
            return Ok(None);
        }
        if len == self.offset {
            return Ok(None);
        }

        self.file.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::new();
        (&mut self.file)
            .take(len - self.offset)
            .read_to_end(&mut buf)
            .await?;

        // A trailing partial line waits for its newline.
        let Some(last_newline) = buf.iter().rposition(|b| *b == b'\n') else {
            return Ok(None);
        };
        self.offset += last_newline as u64 + 1;
        Ok(Some(split_lines(&buf[..last_newline])))
    }

    fn take_batch(&mut self, lines: Vec<String>) -> LogBatch {
        let batch = LogBatch::new(self.is_new_session, lines);
        self.is_new_session = false;
        batch
    }
}

fn split_lines(bytes: &[u8]) -> Vec<String> {
    bytes
        .split(|b| *b == b'\n')
        .map(|line| {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            String::from_utf8_lossy(line).into_owned()
        })
        .collect()
}

/// A live reader over one log file.
///
/// [`dispose`](Self::dispose) stops the reader and waits for it. Dropping
/// the session only signals the reader, which then exits on its next tick.
pub struct TailSession {
    path: PathBuf,
    idle: Arc<LinearPollingInterval>,
    shutdown: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for TailSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TailSession")
            .field("path", &self.path)
            .field("running", &self.task.is_some())
            .finish_non_exhaustive()
    }
}

impl TailSession {
    /// Open `path` and start the reader.
    ///
    /// The starting offset is the file length at this call.
    pub async fn open(
        path: &Path,
        is_new_session: bool,
        tick: Duration,
        sink: mpsc::Sender<LogBatch>,
    ) -> Result<Self, TailError> {
        if !path.is_file() {
            return Err(TailError::Missing(path.to_path_buf()));
        }
        let open_err = |source| TailError::Open {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).await.map_err(open_err)?;
        let offset = file.metadata().await.map_err(open_err)?.len();

        let reader = Reader {
            path: path.to_path_buf(),
            file,
            offset,
            is_new_session,
            pending: None,
        };
        let idle = Arc::new(LinearPollingInterval::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run_reader(
            reader,
            tick,
            sink,
            Arc::clone(&idle),
            Arc::clone(&shutdown),
        ));

        debug!(path = %path.display(), offset, is_new_session, "tail session opened");
        Ok(Self {
            path: path.to_path_buf(),
            idle,
            shutdown,
            task: Some(task),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// More than `duration` without a delivered batch or reset. A zero
    /// duration is never idle.
    #[must_use]
    pub fn is_idle(&self, duration: Duration) -> bool {
        self.idle.is_time_for_polling(duration)
    }

    pub fn reset_idle_timer(&self) {
        self.idle.reset();
    }

    /// Stop the reader and wait until it has exited.
    pub async fn dispose(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(path = %self.path.display(), error = %e, "tail reader ended abnormally");
            }
        }
        debug!(path = %self.path.display(), "tail session disposed");
    }
}

impl Drop for TailSession {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

async fn run_reader(
    mut reader: Reader,
    tick: Duration,
    sink: mpsc::Sender<LogBatch>,
    idle: Arc<LinearPollingInterval>,
    shutdown: Arc<AtomicBool>,
) {
    let mut consecutive_failures: u64 = 0;
    while !shutdown.load(Ordering::SeqCst) {
        let batch = match reader.pending.take() {
            Some(batch) => Some(batch),
            None => match reader.poll().await {
                Ok(lines) => {
                    if consecutive_failures > 0 {
                        info!(
                            path = %reader.path.display(),
                            failures = consecutive_failures,
                            "log file readable again"
                        );
                        consecutive_failures = 0;
                    }
                    lines.map(|lines| reader.take_batch(lines))
                }
                Err(e) => {
                    consecutive_failures += 1;
                    if should_warn_read_failure(consecutive_failures) {
                        warn!(
                            path = %reader.path.display(),
                            error = %e,
                            consecutive = consecutive_failures,
                            "failed to read log file"
                        );
                    } else {
                        trace!(path = %reader.path.display(), error = %e, "log file still unreadable");
                    }
                    None
                }
            },
        };

        if let Some(batch) = batch {
            let count = batch.lines.len();
            // Bounded wait so dispose never deadlocks against a consumer
            // that is itself waiting on the disposer.
            match sink.send_timeout(batch, tick).await {
                Ok(()) => {
                    idle.reset();
                    trace!(path = %reader.path.display(), lines = count, "delivered batch");
                }
                Err(SendTimeoutError::Timeout(batch)) => {
                    reader.pending = Some(batch);
                    continue;
                }
                Err(SendTimeoutError::Closed(_)) => {
                    debug!(path = %reader.path.display(), "batch consumer gone, reader stopping");
                    break;
                }
            }
        }

        tokio::time::sleep(tick).await;
    }
}
