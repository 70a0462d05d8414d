//! Readiness and failure monitoring over the server's output.
//!
//! The server either writes to `server_log.txt` (tailed from disk) or to its own stdout
//! (followed through a pipe). Both strategies report through the same [`MonitorEvent`]s.
use std::{
    fs::{File, OpenOptions},
    io::{self, BufRead, BufReader, ErrorKind, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use tracing::{debug, warn};

use crate::constants::TAIL_POLL_INTERVAL;

/// Notification raised by a [`LogMonitor`].
#[derive(Debug)]
pub enum MonitorEvent {
    /// A complete output line, without its line terminator.
    Output(String),
    /// Reading failed. `Ended` follows.
    Failed(io::Error),
    /// The stream ended while the monitor was still open.
    Ended,
}

/// Receiver of monitor notifications. Invoked on the monitor's worker thread.
pub type MonitorSink = Arc<dyn Fn(MonitorEvent) + Send + Sync>;

/// Makes sure the log file exists before the server is started.
///
/// A missing file is created. An existing file is opened and released to confirm it is
/// accessible.
pub fn ensure_log_file(path: &Path) -> io::Result<()> {
    match File::open(path) {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!("Creating log file {path:?}");
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map(drop)
        }
        Err(err) => Err(err),
    }
}

/// Handle to a running log watcher.
pub struct LogMonitor {
    open: Arc<AtomicBool>,
    source: String,
}

impl std::fmt::Debug for LogMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogMonitor")
            .field("source", &self.source)
            .field("open", &self.is_open())
            .finish()
    }
}

impl LogMonitor {
    /// Follows `path` from its current end, reporting each new line.
    pub fn tail_file(path: &Path, sink: MonitorSink) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let position = file.seek(SeekFrom::End(0))?;

        let open = Arc::new(AtomicBool::new(true));
        let tail = FileTail {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            position,
            pending: Vec::new(),
        };

        let flag = Arc::clone(&open);
        thread::Builder::new()
            .name("sampd-log-tail".into())
            .spawn(move || tail.run(&flag, &sink))?;

        debug!("Tailing server log {path:?} from offset {position}");
        Ok(Self {
            open,
            source: path.display().to_string(),
        })
    }

    /// Follows a process output stream until EOF.
    pub fn follow_stream<R>(stream: R, sink: MonitorSink) -> io::Result<Self>
    where
        R: Read + Send + 'static,
    {
        let open = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&open);

        thread::Builder::new()
            .name("sampd-stdout".into())
            .spawn(move || follow(BufReader::new(stream), &flag, &sink))?;

        Ok(Self {
            open,
            source: "stdout".into(),
        })
    }

    /// Whether the monitor still delivers events.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Stops event delivery. Never blocks, so it is safe to call from a sink.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            debug!("Closed log monitor on {}", self.source);
        }
    }
}

impl Drop for LogMonitor {
    fn drop(&mut self) {
        self.close();
    }
}

struct FileTail {
    path: PathBuf,
    reader: BufReader<File>,
    position: u64,
    pending: Vec<u8>,
}

impl FileTail {
    fn run(mut self, open: &AtomicBool, sink: &MonitorSink) {
        while open.load(Ordering::SeqCst) {
            match self.poll(open, sink) {
                Ok(true) => {}
                Ok(false) => thread::sleep(TAIL_POLL_INTERVAL),
                Err(err) => {
                    if open.load(Ordering::SeqCst) {
                        warn!("Log tail on {:?} failed: {err}", self.path);
                        sink(MonitorEvent::Failed(err));
                        sink(MonitorEvent::Ended);
                    }
                    return;
                }
            }
        }
    }

    /// Reads whatever is available. Returns false when there was nothing new.
    fn poll(&mut self, open: &AtomicBool, sink: &MonitorSink) -> io::Result<bool> {
        let len = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(io::Error::new(ErrorKind::NotFound, "log file removed"));
            }
            Err(err) => return Err(err),
        };

        if len < self.position {
            debug!("Log file {:?} truncated; rewinding", self.path);
            self.reader.seek(SeekFrom::Start(0))?;
            self.position = 0;
            self.pending.clear();
        }

        let mut progressed = false;
        loop {
            let read = self.reader.read_until(b'\n', &mut self.pending)?;
            if read == 0 {
                break;
            }
            self.position += read as u64;
            progressed = true;

            if self.pending.last() == Some(&b'\n') {
                let line = take_line(&mut self.pending);
                if !open.load(Ordering::SeqCst) {
                    return Ok(true);
                }
                sink(MonitorEvent::Output(line));
            }
        }

        Ok(progressed)
    }
}

fn follow<R: BufRead>(mut reader: R, open: &AtomicBool, sink: &MonitorSink) {
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                if !open.load(Ordering::SeqCst) {
                    return;
                }
                sink(MonitorEvent::Output(take_line(&mut buf)));
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                if open.load(Ordering::SeqCst) {
                    sink(MonitorEvent::Failed(err));
                }
                break;
            }
        }
    }

    if open.load(Ordering::SeqCst) {
        sink(MonitorEvent::Ended);
    }
}

fn take_line(buf: &mut Vec<u8>) -> String {
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    let line = String::from_utf8_lossy(buf).into_owned();
    buf.clear();
    line
}
