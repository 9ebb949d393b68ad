//! Byte buffers used by the handshake stages.
//!
//! [`InBuffer`] accumulates bytes read from a socket and hands them out
//! through a read cursor; [`ReadTx`] makes speculative parsing possible:
//! a PDU parser reads as far as it can and commits only when the whole PDU
//! is present, otherwise the read position is rewound on drop and the next
//! socket read appends more bytes.

use bytes::Bytes;

/// Outcome of an attempt to parse accumulated bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    NeedMore,
    Success,
    InvalidData,
}

/// A fixed-capacity input buffer with a read cursor.
#[derive(Debug)]
pub struct InBuffer {
    data: Vec<u8>,
    size: usize,
    read_pos: usize,
}

impl InBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { data: vec![0u8; capacity], size: 0, read_pos: 0 }
    }

    /// A buffer whose initial content is already known (bytes carried over
    /// from a previous stage).
    pub fn with_initial(capacity: usize, initial: &[u8]) -> Self {
        assert!(
            initial.len() <= capacity,
            "initial content doesn't fit into the buffer, capacity: {}, initial: {}",
            capacity,
            initial.len()
        );
        let mut data = vec![0u8; capacity];
        data[..initial.len()].copy_from_slice(initial);
        Self { data, size: initial.len(), read_pos: 0 }
    }

    pub fn read_byte(&mut self) -> Option<u8> {
        if self.read_pos >= self.size {
            return None;
        }
        let b = self.data[self.read_pos];
        self.read_pos += 1;
        Some(b)
    }

    /// Returns up to `length` bytes as a borrowed view, advancing the
    /// cursor by the returned amount.
    pub fn read_bytes(&mut self, length: usize) -> Option<&[u8]> {
        if self.read_pos >= self.size {
            return None;
        }
        let take = length.min(self.size - self.read_pos);
        let pos = self.read_pos;
        self.read_pos += take;
        Some(&self.data[pos..pos + take])
    }

    pub fn remaining(&self) -> usize {
        self.size - self.read_pos
    }

    pub fn total_size(&self) -> usize {
        self.size
    }

    pub fn read_position(&self) -> usize {
        self.read_pos
    }

    pub fn rewind_read_position(&mut self, pos: usize) {
        assert!(pos <= self.size, "invalid position to rewind: {}, size: {}", pos, self.size);
        self.read_pos = pos;
    }

    /// The free tail the next socket read should fill.
    pub fn free_space_mut(&mut self) -> &mut [u8] {
        let size = self.size;
        &mut self.data[size..]
    }

    /// Grows the written area after an I/O read into [`Self::free_space_mut`].
    pub fn increment_bytes_read(&mut self, n: usize) {
        let new_size = self.size + n;
        assert!(
            new_size <= self.data.len(),
            "buffer capacity overflow, capacity: {}, size: {}, new_size: {}",
            self.data.len(),
            self.size,
            new_size
        );
        self.size = new_size;
    }

    pub fn whole_data(&self) -> &[u8] {
        &self.data[..self.size]
    }

    pub fn is_full(&self) -> bool {
        self.size == self.data.len()
    }
}

/// Scoped read transaction: restores the read position on drop unless
/// [`ReadTx::commit`] was called.
pub struct ReadTx<'a> {
    buffer: &'a mut InBuffer,
    initial_pos: usize,
    committed: bool,
}

impl<'a> ReadTx<'a> {
    pub fn new(buffer: &'a mut InBuffer) -> Self {
        let initial_pos = buffer.read_position();
        Self { buffer, initial_pos, committed: false }
    }

    pub fn commit(&mut self) {
        self.committed = true;
    }
}

impl std::ops::Deref for ReadTx<'_> {
    type Target = InBuffer;

    fn deref(&self) -> &InBuffer {
        self.buffer
    }
}

impl std::ops::DerefMut for ReadTx<'_> {
    fn deref_mut(&mut self) -> &mut InBuffer {
        self.buffer
    }
}

impl Drop for ReadTx<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.buffer.rewind_read_position(self.initial_pos);
        }
    }
}

/// A fixed-size output buffer with a write cursor over the unsent part.
#[derive(Debug, Default)]
pub struct OutBuffer {
    data: Vec<u8>,
    bytes_written: usize,
}

impl OutBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_byte(&mut self, b: u8) {
        self.data.push(b);
    }

    pub fn write_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// How many bytes have not been sent yet.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.bytes_written
    }

    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }

    pub fn total_size(&self) -> usize {
        self.data.len()
    }

    /// The contiguous unsent slice.
    pub fn unsent(&self) -> &[u8] {
        &self.data[self.bytes_written..]
    }

    pub fn increment_bytes_written(&mut self, n: usize) {
        let new_written = self.bytes_written + n;
        assert!(
            new_written <= self.data.len(),
            "buffer size overflow, size: {}, new_written: {}",
            self.data.len(),
            new_written
        );
        self.bytes_written = new_written;
    }

    pub fn reset(&mut self) {
        self.data.clear();
        self.bytes_written = 0;
    }
}

/// One queued piece of outgoing data.
///
/// Body bytes lifted out of an input buffer travel as [`Bytes`] so the
/// piece stays valid while earlier pieces are still being written.
#[derive(Debug)]
pub enum OutPiece {
    Static(&'static str),
    Owned(String),
    Shared(Bytes),
}

impl OutPiece {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            OutPiece::Static(s) => s.as_bytes(),
            OutPiece::Owned(s) => s.as_bytes(),
            OutPiece::Shared(b) => b,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A piece being drained into a socket: the unsent part starts at `written`.
#[derive(Debug)]
pub struct OutCursor {
    piece: OutPiece,
    written: usize,
}

impl OutCursor {
    pub fn new(piece: OutPiece) -> Self {
        Self { piece, written: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.piece.len() - self.written
    }

    pub fn unsent(&self) -> &[u8] {
        &self.piece.as_bytes()[self.written..]
    }

    pub fn advance(&mut self, n: usize) {
        let new_written = self.written + n;
        assert!(
            new_written <= self.piece.len(),
            "piece overflow, size: {}, new_written: {}",
            self.piece.len(),
            new_written
        );
        self.written = new_written;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_transaction_rewinds_on_drop() {
        let mut buffer = InBuffer::with_initial(16, b"\x05\x01");
        {
            let mut tx = ReadTx::new(&mut buffer);
            assert_eq!(tx.read_byte(), Some(0x05));
            assert_eq!(tx.read_byte(), Some(0x01));
            assert_eq!(tx.read_byte(), None);
            // dropped without commit
        }
        assert_eq!(buffer.read_position(), 0);
        assert_eq!(buffer.remaining(), 2);
    }

    #[test]
    fn read_transaction_commit_keeps_position() {
        let mut buffer = InBuffer::with_initial(16, b"\x05\x01\x00");
        {
            let mut tx = ReadTx::new(&mut buffer);
            assert_eq!(tx.read_byte(), Some(0x05));
            tx.commit();
        }
        assert_eq!(buffer.read_position(), 1);
        assert_eq!(buffer.remaining(), 2);
    }

    #[test]
    fn incremental_reads_append_to_tail() {
        let mut buffer = InBuffer::new(8);
        buffer.free_space_mut()[..3].copy_from_slice(b"abc");
        buffer.increment_bytes_read(3);
        assert_eq!(buffer.whole_data(), b"abc");

        buffer.free_space_mut()[..2].copy_from_slice(b"de");
        buffer.increment_bytes_read(2);
        assert_eq!(buffer.whole_data(), b"abcde");

        assert_eq!(buffer.read_bytes(4), Some(&b"abcd"[..]));
        assert_eq!(buffer.remaining(), 1);
        // read_bytes never crosses the written area
        assert_eq!(buffer.read_bytes(100), Some(&b"e"[..]));
        assert_eq!(buffer.read_bytes(1), None);
    }

    #[test]
    fn out_cursor_tracks_unsent_slice() {
        let mut cursor = OutCursor::new(OutPiece::Owned("hello".to_string()));
        assert_eq!(cursor.unsent(), b"hello");
        cursor.advance(2);
        assert_eq!(cursor.unsent(), b"llo");
        assert_eq!(cursor.remaining(), 3);
        cursor.advance(3);
        assert_eq!(cursor.remaining(), 0);
    }
}
