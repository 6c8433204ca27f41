//! Message transport between the worker and its host.
//!
//! Two channels are used. The control channel carries synchronous
//! multi-frame requests, each answered by one multi-frame reply. The publish
//! channel carries position broadcasts from every running simulation; a
//! published message is written as one unit and never interleaves with
//! another.
//!
//! ## Module Organization
//!
//! - `framing`: length-prefixed encoding of one multi-frame message on a byte stream
//! - `tcp`: socket implementations used by the worker binary
//! - `memory`: in-process implementations used by tests

pub mod framing;
pub mod memory;
pub mod tcp;

use thiserror::Error;

pub use memory::{MemoryClient, MemoryControlChannel, MemoryPublisher};
pub use tcp::{TcpControlChannel, TcpPublisher};

/// One frame of a multi-frame message.
pub type Frame = Vec<u8>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {len} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { len: usize, limit: usize },

    #[error("channel closed")]
    Closed,
}

/// Request/reply side of the protocol.
///
/// Frames of a request are consumed one at a time; [`ControlChannel::has_more`]
/// tells whether the current request still has unread frames.
pub trait ControlChannel: Send {
    /// Next frame of the current request, blocking for a new request when
    /// the previous one was fully read.
    fn recv(&mut self) -> Result<Frame, Error>;

    fn has_more(&self) -> bool;

    /// Sends one reply made of `frames`.
    fn send(&mut self, frames: Vec<Frame>) -> Result<(), Error>;
}

/// Broadcast side of the protocol, shared by all simulations.
pub trait Publisher: Send + Sync {
    /// Publishes `frames` as one message.
    fn publish(&self, frames: Vec<Frame>) -> Result<(), Error>;
}

/// Frame holding the bytes of `text`.
pub fn text(text: impl AsRef<str>) -> Frame {
    text.as_ref().as_bytes().to_vec()
}
