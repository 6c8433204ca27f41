//! Binary payload codec for the host protocol.
//!
//! Every multi-byte value is little-endian. Records are read with a
//! [`PayloadReader`] cursor in a fixed field order and are only accepted when
//! the cursor lands exactly on the end of the frame.
//!
//! ## Module Organization
//!
//! - `reader`: cursor over an immutable frame with fixed-width primitive reads
//! - `writer`: the inverse, used for replies, broadcasts and tests
//! - `records`: Header, SimulationParameters, Topology body and State body

pub mod reader;
pub mod records;
pub mod writer;

use thiserror::Error;

pub use reader::PayloadReader;
pub use records::{AtomRecord, BondRecord, Header, MoleculeRecord, SimulationParameters, StateRecord, TopologyRecord};
pub use writer::PayloadWriter;

/// Errors produced while decoding a payload frame.
#[derive(Debug, Error, PartialEq)]
pub enum Error {
    /// A read needed more bytes than the frame had left.
    #[error("truncated payload: needed {needed} bytes at offset {offset}, {remaining} remaining")]
    Truncated { offset: usize, needed: usize, remaining: usize },

    /// All fields were read but the frame has bytes left over.
    #[error("malformed record: consumed {consumed} of {len} bytes")]
    TrailingBytes { consumed: usize, len: usize },

    /// A length-prefixed string did not contain valid UTF-8.
    #[error("malformed record: string at offset {offset} is not valid UTF-8")]
    InvalidUtf8 { offset: usize },

    /// A field holds a value the record layout does not allow.
    #[error("malformed record: {0}")]
    Malformed(String),
}

impl Error {
    pub fn malformed(details: impl Into<String>) -> Self {
        Self::Malformed(details.into())
    }
}

/// Encodes a flat list of positions as consecutive `f64` triples.
pub fn encode_positions(positions: &[[f64; 3]]) -> Vec<u8> {
    let mut writer = PayloadWriter::with_capacity(positions.len() * 24);
    for position in positions {
        for &coordinate in position {
            writer.write_f64(coordinate);
        }
    }
    writer.into_bytes()
}
