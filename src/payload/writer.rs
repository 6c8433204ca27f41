//! Frame builder mirroring [`PayloadReader`](super::PayloadReader).

#[derive(Debug, Default)]
pub struct PayloadWriter {
    buffer: Vec<u8>,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    /// Writes a sign-magnitude byte. Magnitudes above 127 are saturated.
    pub fn write_sign_magnitude_i8(&mut self, value: i8) {
        let magnitude = value.unsigned_abs().min(0b0111_1111);
        let sign = if value < 0 { 0b1000_0000 } else { 0 };
        self.buffer.push(sign | magnitude);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_f64(&mut self, value: f64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_vec3(&mut self, value: [f64; 3]) {
        for coordinate in value {
            self.write_f64(coordinate);
        }
    }

    /// Writes a UTF-8 string with a signed 16-bit length prefix.
    ///
    /// Strings longer than `i16::MAX` bytes are cut at the last char boundary that fits.
    pub fn write_utf8_string(&mut self, value: &str) {
        let mut end = value.len().min(i16::MAX as usize);
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        self.buffer.extend_from_slice(&(end as i16).to_le_bytes());
        self.buffer.extend_from_slice(&value.as_bytes()[..end]);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}
