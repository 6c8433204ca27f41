//! Wire format of one multi-frame message:
//! `frame_count: u32` followed by `frame_count × (len: u32, bytes)`, little-endian.

use std::io::{Read, Write};

use super::{Error, Frame};

/// Largest accepted frame, 64 MiB. A State frame of a million atoms is 24 MB.
pub const MAX_FRAME_LEN: usize = 64 << 20;

pub fn write_message<W: Write>(writer: &mut W, frames: &[Frame]) -> Result<(), Error> {
    let mut buffer = Vec::with_capacity(4 + frames.iter().map(|frame| frame.len() + 4).sum::<usize>());
    buffer.extend_from_slice(&(frames.len() as u32).to_le_bytes());
    for frame in frames {
        if frame.len() > MAX_FRAME_LEN {
            return Err(Error::FrameTooLarge {
                len: frame.len(),
                limit: MAX_FRAME_LEN,
            });
        }
        buffer.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        buffer.extend_from_slice(frame);
    }
    writer.write_all(&buffer)?;
    writer.flush()?;
    Ok(())
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, Error> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

/// Reads one message. A stream that ends before the first byte yields [`Error::Closed`].
pub fn read_message<R: Read>(reader: &mut R) -> Result<Vec<Frame>, Error> {
    let count = match read_u32(reader) {
        Ok(count) => count,
        Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Err(Error::Closed),
        Err(err) => return Err(err),
    };
    let mut frames = Vec::with_capacity(count.min(64) as usize);
    for _ in 0..count {
        let len = read_u32(reader)? as usize;
        if len > MAX_FRAME_LEN {
            return Err(Error::FrameTooLarge { len, limit: MAX_FRAME_LEN });
        }
        // grows with the bytes that actually arrive
        let mut frame = Vec::new();
        reader.by_ref().take(len as u64).read_to_end(&mut frame)?;
        if frame.len() < len {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        frames.push(frame);
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn message_layout() {
        let mut buffer = Vec::new();
        write_message(&mut buffer, &[b"ab".to_vec(), Vec::new()]).unwrap();
        assert_eq!(buffer, vec![2, 0, 0, 0, 2, 0, 0, 0, b'a', b'b', 0, 0, 0, 0]);
    }

    #[test]
    fn consecutive_messages_are_read_in_order() {
        let mut buffer = Vec::new();
        write_message(&mut buffer, &[b"Quit".to_vec()]).unwrap();
        write_message(&mut buffer, &[b"one".to_vec(), b"two".to_vec()]).unwrap();
        let mut cursor = Cursor::new(buffer);
        assert_eq!(read_message(&mut cursor).unwrap(), vec![b"Quit".to_vec()]);
        assert_eq!(read_message(&mut cursor).unwrap(), vec![b"one".to_vec(), b"two".to_vec()]);
        assert!(matches!(read_message(&mut cursor), Err(Error::Closed)));
    }

    #[test]
    fn truncated_frame_is_an_io_error() {
        let mut cursor = Cursor::new(vec![1, 0, 0, 0, 5, 0, 0, 0, b'x']);
        assert!(matches!(read_message(&mut cursor), Err(Error::Io(_))));
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut cursor = Cursor::new(vec![1, 0, 0, 0, 0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(read_message(&mut cursor), Err(Error::FrameTooLarge { .. })));

        let mut bytes = vec![1, 0, 0, 0];
        bytes.extend_from_slice(&((MAX_FRAME_LEN + 1) as u32).to_le_bytes());
        assert!(matches!(read_message(&mut Cursor::new(bytes)), Err(Error::FrameTooLarge { .. })));
    }

    #[test]
    fn declared_length_beyond_stream_is_an_io_error() {
        let mut bytes = vec![1, 0, 0, 0];
        bytes.extend_from_slice(&(MAX_FRAME_LEN as u32).to_le_bytes());
        bytes.extend_from_slice(b"short");
        assert!(matches!(read_message(&mut Cursor::new(bytes)), Err(Error::Io(_))));
    }
}
