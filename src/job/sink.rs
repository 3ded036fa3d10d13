//! Fan-out sink for job stdio.
//!
//! Buffers every byte written so far and tees live writes to any
//! number of attached consumers; a consumer attaching late still sees
//! the full history from byte zero via replay. Each consumer is an
//! `mpsc::UnboundedSender<Bytes>`; a `send().is_err()` marks a consumer
//! as gone and it's pruned from the list on the next write.

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

struct State {
    buffer: Vec<u8>,
    closed: bool,
    writers: Vec<mpsc::UnboundedSender<Bytes>>,
}

pub struct FanoutSink {
    state: Mutex<State>,
}

impl Default for FanoutSink {
    fn default() -> Self {
        Self::new()
    }
}

impl FanoutSink {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                buffer: Vec::new(),
                closed: false,
                writers: Vec::new(),
            }),
        }
    }

    /// Attach a new consumer. It immediately receives the buffer
    /// replayed as one chunk (if non-empty), then every subsequent
    /// write until the sink closes.
    pub fn add(&self) -> mpsc::UnboundedReceiver<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        if !state.buffer.is_empty() {
            let _ = tx.send(Bytes::copy_from_slice(&state.buffer));
        }
        if !state.closed {
            state.writers.push(tx);
        }
        rx
    }

    /// Append to the buffer and fan out to every live writer, pruning
    /// any whose receiver has gone away.
    pub fn write(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        state.buffer.extend_from_slice(data);
        let chunk = Bytes::copy_from_slice(data);
        state.writers.retain(|w| w.send(chunk.clone()).is_ok());
    }

    /// Close the sink: drop every writer (closing their receivers) and
    /// flip the sticky closed flag so future `add` calls get a replay
    /// but no live feed.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.writers.clear();
    }

    /// The full buffer accumulated so far.
    pub fn snapshot(&self) -> Vec<u8> {
        self.state.lock().buffer.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn late_joiner_replays_from_byte_zero() {
        let sink = FanoutSink::new();
        sink.write(b"hello ");
        let mut rx = sink.add();
        sink.write(b"world");

        let first = rx.try_recv().unwrap();
        assert_eq!(&first[..], b"hello ");
        let second = rx.try_recv().unwrap();
        assert_eq!(&second[..], b"world");
    }

    #[test]
    fn close_drains_writers_and_is_sticky() {
        let sink = FanoutSink::new();
        let mut rx = sink.add();
        sink.write(b"a");
        sink.close();
        assert!(sink.is_closed());

        // existing writer: replay already delivered, then closed
        let _ = rx.try_recv().unwrap();
        assert!(rx.try_recv().is_err());

        // a writer attached after close still gets the replay, no live feed
        let mut late = sink.add();
        let replay = late.try_recv().unwrap();
        assert_eq!(&replay[..], b"a");
        assert!(late.try_recv().is_err());
    }

    #[test]
    fn snapshot_reflects_every_write_in_order() {
        let sink = FanoutSink::new();
        sink.write(b"foo");
        sink.write(b"bar");
        assert_eq!(sink.snapshot(), b"foobar");
    }
}
