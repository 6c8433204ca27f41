//! Cursor over a single payload frame.

use super::Error;

/// Reads fixed-width primitives from a frame, advancing a cursor.
///
/// Every read either consumes exactly its width or fails with
/// [`Error::Truncated`] without moving the cursor.
#[derive(Debug)]
pub struct PayloadReader<'a> {
    chunk: &'a [u8],
    seek: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(chunk: &'a [u8]) -> Self {
        Self { chunk, seek: 0 }
    }

    /// Current cursor offset in bytes.
    pub fn position(&self) -> usize {
        self.seek
    }

    /// Bytes left between the cursor and the end of the frame.
    pub fn remaining(&self) -> usize {
        self.chunk.len() - self.seek
    }

    fn take(&mut self, width: usize) -> Result<&'a [u8], Error> {
        if self.remaining() < width {
            return Err(Error::Truncated {
                offset: self.seek,
                needed: width,
                remaining: self.remaining(),
            });
        }
        let bytes = &self.chunk[self.seek..self.seek + width];
        self.seek += width;
        Ok(bytes)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.take(N)?);
        Ok(array)
    }

    pub fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    /// Reads a sign-magnitude byte: high bit is the sign, low 7 bits the magnitude.
    ///
    /// This is not two's complement: `0b1000_0101` decodes to `-5`.
    pub fn read_sign_magnitude_i8(&mut self) -> Result<i8, Error> {
        let byte = self.read_u8()?;
        let magnitude = (byte & 0b0111_1111) as i8;
        if byte & 0b1000_0000 != 0 { Ok(-magnitude) } else { Ok(magnitude) }
    }

    pub fn read_u32(&mut self) -> Result<u32, Error> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64, Error> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    pub fn read_f64(&mut self) -> Result<f64, Error> {
        Ok(f64::from_le_bytes(self.take_array()?))
    }

    pub fn read_vec3(&mut self) -> Result<[f64; 3], Error> {
        Ok([self.read_f64()?, self.read_f64()?, self.read_f64()?])
    }

    /// Reads a UTF-8 string prefixed by a signed 16-bit little-endian length.
    pub fn read_utf8_string(&mut self) -> Result<String, Error> {
        let start = self.seek;
        let length = i16::from_le_bytes(self.take_array()?);
        if length < 0 {
            self.seek = start;
            return Err(Error::malformed(format!("negative string length {length} at offset {start}")));
        }
        let offset = self.seek;
        let bytes = match self.take(length as usize) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.seek = start;
                return Err(err);
            }
        };
        std::str::from_utf8(bytes).map(str::to_owned).map_err(|_| Error::InvalidUtf8 { offset })
    }

    /// Accepts the record only if every byte of the frame was consumed.
    pub fn finish(self) -> Result<(), Error> {
        if self.seek == self.chunk.len() {
            Ok(())
        } else {
            Err(Error::TrailingBytes {
                consumed: self.seek,
                len: self.chunk.len(),
            })
        }
    }
}
