//! Framed message transport over a duplex byte channel.

use std::io::{Read, Write};
use std::sync::Mutex;

use tracing::debug;

use super::protocol::{Message, read_message, write_message, write_raw_frame};
use crate::error::{Error, Result};

/// Exactly-once framed read/write of one [`Message`] at a time.
///
/// `send` and `receive` may be called concurrently from different threads;
/// concurrent sends are serialised.
pub trait ChannelTransport: Send + Sync {
    fn send(&self, message: &Message) -> Result<()>;

    /// Block until the next message arrives.
    ///
    /// Returns [`Error::Transport`] when the channel is lost and
    /// [`Error::Decode`] when a frame arrived but could not be decoded.
    fn receive(&self) -> Result<Message>;
}

/// [`ChannelTransport`] over a reader/writer pair (child pipes, in-memory pipes).
pub struct StreamTransport<R, W> {
    reader: Mutex<R>,
    writer: Mutex<W>,
}

impl<R, W> StreamTransport<R, W>
where
    R: Read + Send,
    W: Write + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }

    /// Write `bytes` as one frame without encoding them.
    pub fn send_raw(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| Error::Transport("channel writer poisoned".to_string()))?;
        write_raw_frame(&mut *writer, bytes)
    }
}

impl<R, W> ChannelTransport for StreamTransport<R, W>
where
    R: Read + Send,
    W: Write + Send,
{
    fn send(&self, message: &Message) -> Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| Error::Transport("channel writer poisoned".to_string()))?;
        debug!(kind = message.label(), "sending message");
        write_message(&mut *writer, message)
    }

    fn receive(&self) -> Result<Message> {
        let mut reader = self
            .reader
            .lock()
            .map_err(|_| Error::Transport("channel reader poisoned".to_string()))?;
        let message = read_message(&mut *reader)?;
        debug!(kind = message.label(), "received message");
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::pipe::pipe;
    use crate::ipc::protocol::GoalOutcome;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_send_receive_across_threads() {
        let (writer, reader) = pipe();
        let (_unused_writer, unused_reader) = pipe();
        let sender = Arc::new(StreamTransport::new(unused_reader, writer));
        let (reply_writer, _reply_reader) = pipe();
        let receiver = StreamTransport::new(reader, reply_writer);

        let tx = Arc::clone(&sender);
        let handle = thread::spawn(move || {
            for ts in 1..=3 {
                tx.send(&Message::Outcome(GoalOutcome::failure(ts))).unwrap();
            }
        });

        for ts in 1..=3 {
            match receiver.receive().unwrap() {
                Message::Outcome(o) => assert_eq!(o.timestamp, ts),
                other => panic!("unexpected {:?}", other),
            }
        }
        handle.join().unwrap();
    }

    #[test]
    fn test_closed_channel_reports_transport_error() {
        let (writer, reader) = pipe();
        let (w2, _r2) = pipe();
        let transport = StreamTransport::new(reader, w2);
        drop(writer);
        assert!(matches!(transport.receive(), Err(Error::Transport(_))));
    }
}
