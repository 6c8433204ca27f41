//! TCP implementations of the control and publish channels.
//!
//! The control listener serves one host connection at a time; when the host
//! disconnects the next connection is accepted. The publisher accepts any
//! number of subscribers on a background thread and drops those whose
//! socket fails. A subscriber that stops reading is dropped once a write has
//! been stuck for [`SUBSCRIBER_WRITE_TIMEOUT`].

use std::collections::VecDeque;
use std::io::BufReader;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::framing::{read_message, write_message};
use super::{ControlChannel, Error, Frame, Publisher};

/// Longest a publish may wait on one subscriber socket.
pub const SUBSCRIBER_WRITE_TIMEOUT: Duration = Duration::from_millis(250);

pub struct TcpControlChannel {
    listener: TcpListener,
    connection: Option<(BufReader<TcpStream>, TcpStream)>,
    pending: VecDeque<Frame>,
}

impl TcpControlChannel {
    pub fn bind(address: impl ToSocketAddrs) -> Result<Self, Error> {
        let listener = TcpListener::bind(address)?;
        log::info!("Control channel listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            connection: None,
            pending: VecDeque::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    fn read_request(&mut self) -> Result<Vec<Frame>, Error> {
        loop {
            if self.connection.is_none() {
                let (stream, peer) = self.listener.accept()?;
                stream.set_nodelay(true)?;
                log::info!("Host connected from {peer}");
                let writer = stream.try_clone()?;
                self.connection = Some((BufReader::new(stream), writer));
            }
            let Some((reader, _)) = self.connection.as_mut() else {
                continue;
            };
            match read_message(reader) {
                Ok(frames) if frames.is_empty() => continue,
                Ok(frames) => return Ok(frames),
                Err(Error::Closed) => {
                    log::info!("Host disconnected");
                    self.connection = None;
                }
                Err(err) => {
                    log::error!("Dropping host connection: {err}");
                    self.connection = None;
                }
            }
        }
    }
}

impl ControlChannel for TcpControlChannel {
    fn recv(&mut self) -> Result<Frame, Error> {
        if self.pending.is_empty() {
            self.pending = self.read_request()?.into();
        }
        self.pending.pop_front().ok_or(Error::Closed)
    }

    fn has_more(&self) -> bool {
        !self.pending.is_empty()
    }

    fn send(&mut self, frames: Vec<Frame>) -> Result<(), Error> {
        let Some((_, writer)) = self.connection.as_mut() else {
            return Err(Error::Closed);
        };
        write_message(writer, &frames)
    }
}

pub struct TcpPublisher {
    local_addr: SocketAddr,
    subscribers: Arc<Mutex<Vec<TcpStream>>>,
}

impl TcpPublisher {
    /// Binds the publish address and starts accepting subscribers.
    pub fn bind(address: impl ToSocketAddrs) -> Result<Self, Error> {
        let listener = TcpListener::bind(address)?;
        let local_addr = listener.local_addr()?;
        log::info!("Publish channel listening on {local_addr}");

        let subscribers = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::clone(&subscribers);
        std::thread::Builder::new().name("publish-accept".to_string()).spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        if let Err(err) = configure_subscriber(&stream) {
                            log::warn!("Failed to configure subscriber socket: {err}");
                            continue;
                        }
                        log::debug!("Subscriber connected");
                        accepted.lock().push(stream);
                    }
                    Err(err) => log::warn!("Failed to accept subscriber: {err}"),
                }
            }
        })?;

        Ok(Self { local_addr, subscribers })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

fn configure_subscriber(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    stream.set_write_timeout(Some(SUBSCRIBER_WRITE_TIMEOUT))
}

impl Publisher for TcpPublisher {
    /// Writes `frames` to every subscriber. A subscriber whose write fails or
    /// times out may have received part of the message, so it is dropped.
    fn publish(&self, frames: Vec<Frame>) -> Result<(), Error> {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain_mut(|stream| match write_message(stream, &frames) {
            Ok(()) => true,
            Err(Error::Io(err)) if matches!(err.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                log::warn!("Dropping subscriber that stopped reading");
                false
            }
            Err(err) => {
                log::debug!("Dropping subscriber: {err}");
                false
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn request_and_reply_over_loopback() {
        let mut channel = TcpControlChannel::bind("127.0.0.1:0").unwrap();
        let address = channel.local_addr().unwrap();
        let host = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(address).unwrap();
            write_message(&mut stream, &[b"GetProcessID".to_vec(), b"extra".to_vec()]).unwrap();
            read_message(&mut stream).unwrap()
        });

        assert_eq!(channel.recv().unwrap(), b"GetProcessID".to_vec());
        assert!(channel.has_more());
        assert_eq!(channel.recv().unwrap(), b"extra".to_vec());
        assert!(!channel.has_more());
        channel.send(vec![b"ack".to_vec()]).unwrap();
        assert_eq!(host.join().unwrap(), vec![b"ack".to_vec()]);
    }

    fn wait_for_subscribers(publisher: &TcpPublisher, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while publisher.subscribers.lock().len() < count && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn subscribers_receive_whole_messages() {
        let publisher = TcpPublisher::bind("127.0.0.1:0").unwrap();
        let mut subscriber = TcpStream::connect(publisher.local_addr()).unwrap();
        wait_for_subscribers(&publisher, 1);

        publisher.publish(vec![b"7".to_vec(), 1.0f64.to_le_bytes().to_vec(), b"err".to_vec()]).unwrap();
        let message = read_message(&mut subscriber).unwrap();
        assert_eq!(message.len(), 3);
        assert_eq!(message[2], b"err".to_vec());
    }

    #[test]
    fn stalled_subscriber_does_not_block_the_others() {
        const MESSAGES: usize = 64;
        let publisher = TcpPublisher::bind("127.0.0.1:0").unwrap();
        let _stalled = TcpStream::connect(publisher.local_addr()).unwrap();
        let reading = TcpStream::connect(publisher.local_addr()).unwrap();
        wait_for_subscribers(&publisher, 2);

        let reader = std::thread::spawn(move || {
            let mut reading = BufReader::new(reading);
            (0..MESSAGES).map(|_| read_message(&mut reading).unwrap()[0].len()).sum::<usize>()
        });
        let frame = vec![0u8; 1 << 20];
        for _ in 0..MESSAGES {
            publisher.publish(vec![frame.clone()]).unwrap();
        }

        assert_eq!(reader.join().unwrap(), MESSAGES << 20);
        assert_eq!(publisher.subscribers.lock().len(), 1);
    }
}
