/// Per-worker standard stream virtualisation
///
/// The registry is installed once per process and never removed. Every read or
/// write through [`VirtualStdout`], [`VirtualStderr`] or [`VirtualStdin`] looks
/// up the override associated with the calling thread and falls back to the
/// real stream when there is none. Concurrent invocations therefore never
/// serialise on a global stream lock and never see each other's output.
use crate::config::types::{InputMode, OutputMode, StreamModes};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::thread::{self, ThreadId};

/// Per-stream recording limit (bytes). Output past the limit is dropped.
pub const RECORD_LIMIT: usize = 8 * 1024 * 1024;

static REGISTRY: OnceLock<StreamRegistry> = OnceLock::new();

/// Bounded in-memory buffer behind RECORD and RECORD_FORWARD
#[derive(Debug, Default)]
pub struct Capture {
    buf: Mutex<Vec<u8>>,
    truncated: AtomicBool,
}

impl Capture {
    fn append(&self, data: &[u8]) {
        let mut buf = match self.buf.lock() {
            Ok(buf) => buf,
            Err(poisoned) => poisoned.into_inner(),
        };
        let room = RECORD_LIMIT.saturating_sub(buf.len());
        if data.len() > room {
            self.truncated.store(true, Ordering::Relaxed);
        }
        buf.extend_from_slice(&data[..data.len().min(room)]);
    }

    pub fn text(&self) -> String {
        let buf = match self.buf.lock() {
            Ok(buf) => buf,
            Err(poisoned) => poisoned.into_inner(),
        };
        String::from_utf8_lossy(&buf).into_owned()
    }

    pub fn truncated(&self) -> bool {
        self.truncated.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
enum OutputTarget {
    Normal,
    Discard,
    Record(Arc<Capture>),
    RecordForward(Arc<Capture>),
}

impl OutputTarget {
    fn for_mode(mode: OutputMode) -> Self {
        match mode {
            OutputMode::Normal => OutputTarget::Normal,
            OutputMode::Discard => OutputTarget::Discard,
            OutputMode::Record => OutputTarget::Record(Arc::default()),
            OutputMode::RecordForward => OutputTarget::RecordForward(Arc::default()),
        }
    }

    fn capture(&self) -> Option<&Arc<Capture>> {
        match self {
            OutputTarget::Record(c) | OutputTarget::RecordForward(c) => Some(c),
            _ => None,
        }
    }

    fn write<W: Write>(&self, real: impl FnOnce() -> W, data: &[u8]) -> io::Result<usize> {
        match self {
            OutputTarget::Normal => real().write(data),
            OutputTarget::Discard => Ok(data.len()),
            OutputTarget::Record(capture) => {
                capture.append(data);
                Ok(data.len())
            }
            OutputTarget::RecordForward(capture) => {
                capture.append(data);
                real().write_all(data)?;
                Ok(data.len())
            }
        }
    }
}

#[derive(Debug)]
struct Override {
    stdin: InputMode,
    stdout: OutputTarget,
    stderr: OutputTarget,
}

/// Process-wide map from worker thread to its stream override
#[derive(Debug, Default)]
pub struct StreamRegistry {
    overrides: RwLock<HashMap<ThreadId, Arc<Override>>>,
}

impl StreamRegistry {
    /// The process registry, installed on first use.
    pub fn global() -> &'static StreamRegistry {
        REGISTRY.get_or_init(|| {
            log::debug!("Installing stream registry");
            StreamRegistry::default()
        })
    }

    /// Associate `modes` with the calling thread until the guard drops.
    pub fn activate(&'static self, modes: StreamModes) -> Activation {
        let current = Arc::new(Override {
            stdin: modes.stdin,
            stdout: OutputTarget::for_mode(modes.stdout),
            stderr: OutputTarget::for_mode(modes.stderr),
        });
        let thread = thread::current().id();
        let previous = self.replace(thread, Some(current.clone()));
        Activation {
            registry: self,
            thread,
            previous,
            current,
        }
    }

    /// Give the calling thread the association of `parent`, if it has one.
    pub fn inherit(&'static self, parent: ThreadId) -> Inheritance {
        let thread = thread::current().id();
        let inherited = self.lookup(parent);
        let previous = match inherited {
            Some(ov) => self.replace(thread, Some(ov)),
            None => self.lookup(thread),
        };
        Inheritance {
            registry: self,
            thread,
            previous,
        }
    }

    /// Whether the calling thread currently has an override
    pub fn is_overridden(&self) -> bool {
        self.lookup(thread::current().id()).is_some()
    }

    fn lookup(&self, thread: ThreadId) -> Option<Arc<Override>> {
        let map = match self.overrides.read() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.get(&thread).cloned()
    }

    fn replace(&self, thread: ThreadId, value: Option<Arc<Override>>) -> Option<Arc<Override>> {
        let mut map = match self.overrides.write() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        match value {
            Some(v) => map.insert(thread, v),
            None => map.remove(&thread),
        }
    }

    fn current(&self) -> Option<Arc<Override>> {
        self.lookup(thread::current().id())
    }
}

/// Scoped stream override; restores the previous association on drop.
pub struct Activation {
    registry: &'static StreamRegistry,
    thread: ThreadId,
    previous: Option<Arc<Override>>,
    current: Arc<Override>,
}

impl Activation {
    /// Recorded stdout, `None` unless the mode records
    pub fn stdout_text(&self) -> Option<String> {
        self.current.stdout.capture().map(|c| c.text())
    }

    pub fn stderr_text(&self) -> Option<String> {
        self.current.stderr.capture().map(|c| c.text())
    }

    pub fn truncated(&self) -> bool {
        [&self.current.stdout, &self.current.stderr]
            .iter()
            .filter_map(|t| t.capture())
            .any(|c| c.truncated())
    }
}

impl Drop for Activation {
    fn drop(&mut self) {
        self.registry.replace(self.thread, self.previous.take());
    }
}

/// Association borrowed from a parent thread
pub struct Inheritance {
    registry: &'static StreamRegistry,
    thread: ThreadId,
    previous: Option<Arc<Override>>,
}

impl Drop for Inheritance {
    fn drop(&mut self) {
        self.registry.replace(self.thread, self.previous.take());
    }
}

/// Drop-in replacement for `std::io::stdout()`
pub struct VirtualStdout;

/// Drop-in replacement for `std::io::stderr()`
pub struct VirtualStderr;

/// Drop-in replacement for `std::io::stdin()`
pub struct VirtualStdin;

pub fn stdout() -> VirtualStdout {
    VirtualStdout
}

pub fn stderr() -> VirtualStderr {
    VirtualStderr
}

pub fn stdin() -> VirtualStdin {
    VirtualStdin
}

impl Write for VirtualStdout {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match StreamRegistry::global().current() {
            Some(ov) => ov.stdout.write(io::stdout, buf),
            None => io::stdout().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()
    }
}

impl Write for VirtualStderr {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match StreamRegistry::global().current() {
            Some(ov) => ov.stderr.write(io::stderr, buf),
            None => io::stderr().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}

impl Read for VirtualStdin {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mode = StreamRegistry::global()
            .current()
            .map(|ov| ov.stdin)
            .unwrap_or_default();
        match mode {
            InputMode::Normal => io::stdin().read(buf),
            InputMode::Empty => Ok(0),
            InputMode::Closed => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "standard input is closed",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn modes(stdout: OutputMode, stderr: OutputMode, stdin: InputMode) -> StreamModes {
        StreamModes {
            stdin,
            stdout,
            stderr,
        }
    }

    #[test]
    fn record_captures_only_this_thread() {
        let registry = StreamRegistry::global();
        let handles: Vec<_> = (0..4)
            .map(|i| {
                thread::spawn(move || {
                    let act = registry.activate(modes(
                        OutputMode::Record,
                        OutputMode::Record,
                        InputMode::Normal,
                    ));
                    for _ in 0..50 {
                        write!(stdout(), "{}", i).unwrap();
                    }
                    write!(stderr(), "err{}", i).unwrap();
                    (i, act.stdout_text().unwrap(), act.stderr_text().unwrap())
                })
            })
            .collect();
        for handle in handles {
            let (i, out, err) = handle.join().unwrap();
            assert_eq!(out, i.to_string().repeat(50));
            assert_eq!(err, format!("err{}", i));
        }
    }

    #[test]
    fn nested_activation_restores_previous() {
        let registry = StreamRegistry::global();
        let outer = registry.activate(modes(
            OutputMode::Record,
            OutputMode::Normal,
            InputMode::Normal,
        ));
        write!(stdout(), "a").unwrap();
        {
            let inner = registry.activate(modes(
                OutputMode::Discard,
                OutputMode::Normal,
                InputMode::Normal,
            ));
            write!(stdout(), "hidden").unwrap();
            assert_eq!(inner.stdout_text(), None);
        }
        write!(stdout(), "b").unwrap();
        assert_eq!(outer.stdout_text().as_deref(), Some("ab"));
        drop(outer);
        assert!(!registry.is_overridden());
    }

    #[test]
    fn inherited_association_reaches_worker() {
        let registry = StreamRegistry::global();
        let act = registry.activate(modes(
            OutputMode::Record,
            OutputMode::Normal,
            InputMode::Normal,
        ));
        let parent = thread::current().id();
        thread::spawn(move || {
            let _guard = registry.inherit(parent);
            write!(stdout(), "from worker").unwrap();
        })
        .join()
        .unwrap();
        assert_eq!(act.stdout_text().as_deref(), Some("from worker"));
    }

    #[test]
    fn empty_and_closed_input() {
        let registry = StreamRegistry::global();
        let mut buf = [0u8; 4];
        {
            let _act = registry.activate(modes(
                OutputMode::Normal,
                OutputMode::Normal,
                InputMode::Empty,
            ));
            assert_eq!(stdin().read(&mut buf).unwrap(), 0);
        }
        let _act = registry.activate(modes(
            OutputMode::Normal,
            OutputMode::Normal,
            InputMode::Closed,
        ));
        assert!(stdin().read(&mut buf).is_err());
    }

    #[test]
    fn capture_is_bounded() {
        let capture = Capture::default();
        capture.append(&vec![b'x'; RECORD_LIMIT - 1]);
        capture.append(b"yz");
        assert!(capture.truncated());
        assert_eq!(capture.text().len(), RECORD_LIMIT);
    }

    #[test]
    fn activation_reports_truncated_stderr() {
        let registry = StreamRegistry::global();
        let act = registry.activate(modes(
            OutputMode::Record,
            OutputMode::Record,
            InputMode::Normal,
        ));
        write!(stdout(), "short").unwrap();
        assert!(!act.truncated());
        stderr().write_all(&vec![b'e'; RECORD_LIMIT + 1]).unwrap();
        assert!(act.truncated());
        assert_eq!(act.stdout_text().as_deref(), Some("short"));
    }
}
