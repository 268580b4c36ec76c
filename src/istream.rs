//! The istream writer.

/// Byte offset into the interpreter's instruction stream.
pub type IstreamOffset = u32;

/// Placeholder written into a branch-target slot until the forward
/// reference it encodes has resolved.
pub const INVALID_ISTREAM_OFFSET: IstreamOffset = u32::MAX;

/// Append-only writer over the environment's istream buffer.
///
/// The writer takes ownership of the buffer for the duration of one
/// translation. Emission always happens at the end of the buffer;
/// previously emitted `u32` slots can be patched in place once a
/// forward reference resolves. All integers are little-endian.
pub struct IstreamWriter {
    buf: Vec<u8>,
}

impl IstreamWriter {
    /// Wraps the given buffer; emission continues at its end.
    pub fn new(buf: Vec<u8>) -> IstreamWriter {
        IstreamWriter { buf }
    }

    /// The absolute offset the next emission will land at.
    pub fn current_offset(&self) -> IstreamOffset {
        self.buf.len() as IstreamOffset
    }

    /// Appends raw bytes at the current offset.
    pub fn emit(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn emit_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.emit(&value.to_le_bytes());
    }

    pub fn emit_u64(&mut self, value: u64) {
        self.emit(&value.to_le_bytes());
    }

    /// Overwrites a previously emitted `u32` slot without moving the
    /// current offset.
    ///
    /// # Panics
    ///
    /// Panics if `offset` was not produced by an earlier emission.
    pub fn patch_u32(&mut self, offset: IstreamOffset, value: u32) {
        let offset = offset as usize;
        self.buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Releases the underlying buffer.
    pub fn into_buffer(self) -> Vec<u8> {
        self.buf
    }
}
