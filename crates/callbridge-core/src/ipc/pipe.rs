//! In-memory byte pipes for running an engine inside the host process.
//!
//! Each pipe is a bounded-by-memory FIFO guarded by one mutex and condvar.
//! Dropping the writer, or calling [`PipeCloser::close`], ends the stream:
//! readers drain what is left and then see end-of-file.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

#[derive(Default)]
struct PipeState {
    data: VecDeque<u8>,
    closed: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<PipeState>,
    readable: Condvar,
}

impl Shared {
    fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closed = true;
        self.readable.notify_all();
    }
}

/// Reading end of an in-memory pipe.
pub struct PipeReader {
    shared: Arc<Shared>,
}

/// Writing end of an in-memory pipe. Closes the pipe when dropped.
pub struct PipeWriter {
    shared: Arc<Shared>,
}

/// Closes a pipe from outside either end.
#[derive(Clone)]
pub struct PipeCloser {
    shared: Arc<Shared>,
}

/// Create a connected writer/reader pair.
pub fn pipe() -> (PipeWriter, PipeReader) {
    let shared = Arc::new(Shared::default());
    (
        PipeWriter {
            shared: Arc::clone(&shared),
        },
        PipeReader { shared },
    )
}

impl PipeReader {
    pub fn closer(&self) -> PipeCloser {
        PipeCloser {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl PipeWriter {
    pub fn closer(&self) -> PipeCloser {
        PipeCloser {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl PipeCloser {
    pub fn close(&self) {
        self.shared.close();
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self
            .shared
            .state
            .lock()
            .map_err(|_| io::Error::other("pipe poisoned"))?;
        while state.data.is_empty() && !state.closed {
            state = self
                .shared
                .readable
                .wait(state)
                .map_err(|_| io::Error::other("pipe poisoned"))?;
        }
        let n = buf.len().min(state.data.len());
        for (dst, src) in buf.iter_mut().zip(state.data.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self
            .shared
            .state
            .lock()
            .map_err(|_| io::Error::other("pipe poisoned"))?;
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
        }
        state.data.extend(buf);
        self.shared.readable.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.shared.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_bytes_flow_in_order() {
        let (mut w, mut r) = pipe();
        let handle = thread::spawn(move || {
            w.write_all(b"hello ").unwrap();
            w.write_all(b"world").unwrap();
        });
        let mut out = String::new();
        r.read_to_string(&mut out).unwrap();
        handle.join().unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn test_close_unblocks_reader() {
        let (w, mut r) = pipe();
        let closer = w.closer();
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 4];
            r.read(&mut buf).unwrap()
        });
        closer.close();
        assert_eq!(handle.join().unwrap(), 0);
    }

    #[test]
    fn test_write_after_close_is_broken_pipe() {
        let (mut w, r) = pipe();
        r.closer().close();
        let err = w.write(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
