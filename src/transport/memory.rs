//! In-process channels with the same semantics as the TCP ones.

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{ControlChannel, Error, Frame, Publisher};

pub struct MemoryControlChannel {
    requests: Receiver<Vec<Frame>>,
    replies: Sender<Vec<Frame>>,
    pending: VecDeque<Frame>,
}

/// Host end of a [`MemoryControlChannel`].
pub struct MemoryClient {
    requests: Sender<Vec<Frame>>,
    replies: Receiver<Vec<Frame>>,
}

/// Creates a connected worker/host pair.
pub fn control_pair() -> (MemoryControlChannel, MemoryClient) {
    let (request_tx, request_rx) = mpsc::channel();
    let (reply_tx, reply_rx) = mpsc::channel();
    (
        MemoryControlChannel {
            requests: request_rx,
            replies: reply_tx,
            pending: VecDeque::new(),
        },
        MemoryClient {
            requests: request_tx,
            replies: reply_rx,
        },
    )
}

impl ControlChannel for MemoryControlChannel {
    fn recv(&mut self) -> Result<Frame, Error> {
        while self.pending.is_empty() {
            self.pending = self.requests.recv().map_err(|_| Error::Closed)?.into();
        }
        self.pending.pop_front().ok_or(Error::Closed)
    }

    fn has_more(&self) -> bool {
        !self.pending.is_empty()
    }

    fn send(&mut self, frames: Vec<Frame>) -> Result<(), Error> {
        self.replies.send(frames).map_err(|_| Error::Closed)
    }
}

impl MemoryClient {
    pub fn send(&self, frames: Vec<Frame>) -> Result<(), Error> {
        self.requests.send(frames).map_err(|_| Error::Closed)
    }

    pub fn recv(&self, timeout: Duration) -> Result<Vec<Frame>, Error> {
        self.replies.recv_timeout(timeout).map_err(|_| Error::Closed)
    }
}

/// Records every published message.
#[derive(Default)]
pub struct MemoryPublisher {
    messages: Mutex<Vec<Vec<Frame>>>,
    published: Condvar,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<Vec<Frame>> {
        self.messages.lock().clone()
    }

    /// Blocks until at least `count` messages were published or `timeout` passes.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> Vec<Vec<Frame>> {
        let deadline = Instant::now() + timeout;
        let mut messages = self.messages.lock();
        while messages.len() < count {
            if self.published.wait_until(&mut messages, deadline).timed_out() {
                break;
            }
        }
        messages.clone()
    }
}

impl Publisher for MemoryPublisher {
    fn publish(&self, frames: Vec<Frame>) -> Result<(), Error> {
        self.messages.lock().push(frames);
        self.published.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_read_one_by_one() {
        let (mut channel, client) = control_pair();
        client.send(vec![b"AbortSimulation".to_vec(), 3i64.to_le_bytes().to_vec()]).unwrap();
        client.send(vec![b"Quit".to_vec()]).unwrap();

        assert_eq!(channel.recv().unwrap(), b"AbortSimulation".to_vec());
        assert!(channel.has_more());
        assert_eq!(channel.recv().unwrap(), 3i64.to_le_bytes().to_vec());
        assert!(!channel.has_more());
        assert_eq!(channel.recv().unwrap(), b"Quit".to_vec());

        channel.send(vec![b"ack".to_vec()]).unwrap();
        assert_eq!(client.recv(Duration::from_secs(1)).unwrap(), vec![b"ack".to_vec()]);
    }

    #[test]
    fn dropped_client_closes_the_channel() {
        let (mut channel, client) = control_pair();
        drop(client);
        assert!(matches!(channel.recv(), Err(Error::Closed)));
    }

    #[test]
    fn wait_for_returns_after_timeout() {
        let publisher = MemoryPublisher::new();
        publisher.publish(vec![b"1".to_vec()]).unwrap();
        let messages = publisher.wait_for(2, Duration::from_millis(20));
        assert_eq!(messages.len(), 1);
    }
}
