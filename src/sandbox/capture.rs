use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

const READ_CHUNK: usize = 8192;

/// Bytes kept from one stream of a sandboxed process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedStream {
    pub data: Vec<u8>,
    pub truncated: bool,
}

impl CapturedStream {
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Output allowance shared by stdout and stderr of one process
#[derive(Debug)]
pub struct OutputBudget {
    limit: u64,
    seen: AtomicU64,
    exceeded: AtomicBool,
}

impl OutputBudget {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            seen: AtomicU64::new(0),
            exceeded: AtomicBool::new(false),
        }
    }

    /// Charges `n` bytes, returns whether the budget is now used up
    ///
    /// Reaching the limit counts as exceeding it.
    fn charge(&self, n: usize) -> bool {
        let total = self.seen.fetch_add(n as u64, Ordering::Relaxed) + n as u64;
        if total >= self.limit {
            self.exceeded.store(true, Ordering::Release);
        }
        self.exceeded()
    }

    pub fn exceeded(&self) -> bool {
        self.exceeded.load(Ordering::Acquire)
    }

    pub fn seen(&self) -> u64 {
        self.seen.load(Ordering::Relaxed)
    }
}

/// Reads a stream until EOF, keeping at most `cap` bytes
///
/// Reading continues past the cap so the writer never blocks on a full
/// pipe; the surplus is discarded.
fn drain_capped(
    mut reader: impl Read,
    cap: usize,
    budget: &OutputBudget,
    sink: &Mutex<CapturedStream>,
) -> io::Result<()> {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        budget.charge(n);

        let mut stream = sink.lock();
        let room = cap.saturating_sub(stream.data.len());
        let keep = room.min(n);
        stream.data.extend_from_slice(&buf[..keep]);
        if keep < n {
            stream.truncated = true;
        }
    }
}

/// A capture thread attached to one pipe
pub(super) struct Capture {
    name: &'static str,
    sink: Arc<Mutex<CapturedStream>>,
    done: mpsc::Receiver<()>,
}

impl Capture {
    pub(super) fn start(
        name: &'static str,
        reader: impl Read + Send + 'static,
        cap: u64,
        budget: Arc<OutputBudget>,
    ) -> io::Result<Self> {
        let sink = Arc::new(Mutex::new(CapturedStream::default()));
        let (tx, done) = mpsc::channel();
        let cap = usize::try_from(cap).unwrap_or(usize::MAX);

        let thread_sink = sink.clone();
        thread::Builder::new()
            .name(format!("capture-{name}"))
            .spawn(move || {
                if let Err(e) = drain_capped(reader, cap, &budget, &thread_sink) {
                    log::warn!("Reading sandboxed {name} failed: {e}");
                }
                let _ = tx.send(());
            })?;

        Ok(Self { name, sink, done })
    }

    /// Collects the captured bytes, waiting at most `timeout` for EOF
    pub(super) fn finish(self, timeout: Duration) -> CapturedStream {
        let finished = self.done.recv_timeout(timeout).is_ok();
        let mut stream = std::mem::take(&mut *self.sink.lock());
        if !finished {
            // an escaped descendant still holds the pipe open
            log::warn!("Sandboxed {} still open after the process exited", self.name);
            stream.truncated = true;
        }
        stream
    }
}
