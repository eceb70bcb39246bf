//! Per-connection framing buffer.
//!
//! Every message on the wire is a big-endian `u16` length followed by that
//! many payload bytes. `FramedBuffer` owns a fixed-size byte region that
//! socket reads append to, and tracks how far the message currently being
//! assembled has progressed.
//!
//! ## Framing state
//!
//! - `held`: valid bytes at the front of the storage region.
//! - `expected_length`: payload length of the in-flight message, `0` while
//!   the 2-byte header is still incomplete.
//! - `ready`: the whole in-flight payload is resident.
//!
//! Once a header is parsed it is removed from the region, so `storage[0..]`
//! always starts with payload bytes of the in-flight message. The header is
//! never re-read until that message has been consumed; a second `recv`
//! landing in the middle of a payload therefore cannot be mistaken for a
//! new header.

use bytes::Bytes;

/// Length of the frame header.
pub const HEADER_LEN: usize = 2;

/// Largest payload a peer may declare.
pub const MAX_MESSAGE_SIZE: usize = 1000;

/// Storage reserved per connection. Must exceed `MAX_MESSAGE_SIZE + HEADER_LEN`
/// so that a complete frame plus the start of the next one fit together.
pub const BUFFER_CAPACITY: usize = 2000;

/// Encode the frame header for a payload of `len` bytes.
///
/// Returns `None` if `len` exceeds `MAX_MESSAGE_SIZE`.
pub fn encode_header(len: usize) -> Option<[u8; HEADER_LEN]> {
    if len > MAX_MESSAGE_SIZE {
        return None;
    }
    Some((len as u16).to_be_bytes())
}

/// Fixed-capacity buffer that turns a byte stream into discrete messages.
#[derive(Debug)]
pub struct FramedBuffer {
    storage: Box<[u8]>,
    held: usize,
    expected_length: usize,
    ready: bool,
}

impl Default for FramedBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FramedBuffer {
    /// Create an empty buffer with the protocol's storage capacity.
    pub fn new() -> Self {
        Self::with_capacity(BUFFER_CAPACITY)
    }

    /// Create an empty buffer with a custom storage capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        debug_assert!(capacity > MAX_MESSAGE_SIZE + HEADER_LEN);
        Self {
            storage: vec![0u8; capacity].into_boxed_slice(),
            held: 0,
            expected_length: 0,
            ready: false,
        }
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Bytes currently resident.
    #[cfg(test)]
    pub fn held(&self) -> usize {
        self.held
    }

    /// Payload length of the in-flight message, `0` if its header is incomplete.
    pub fn expected_length(&self) -> usize {
        self.expected_length
    }

    /// Whether a complete message is waiting to be consumed.
    #[cfg(test)]
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Whether the in-flight header declared more than `MAX_MESSAGE_SIZE` bytes.
    ///
    /// The buffer does not act on this; the owner must drop the connection.
    pub fn exceeds_limit(&self) -> bool {
        self.expected_length > MAX_MESSAGE_SIZE
    }

    /// Unused tail of the storage region, for reads to land in.
    ///
    /// Call `advance` with the number of bytes written, then `update`.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.held..]
    }

    /// Record that `n` bytes were written into `spare_mut`.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.held + n <= self.storage.len(), "advance past capacity");
        self.held = (self.held + n).min(self.storage.len());
    }

    /// Copy as much of `data` as fits and run `update`.
    ///
    /// Returns the number of bytes copied.
    #[cfg(test)]
    pub fn append(&mut self, data: &[u8]) -> usize {
        let spare = self.spare_mut();
        let n = spare.len().min(data.len());
        spare[..n].copy_from_slice(&data[..n]);
        self.advance(n);
        self.update();
        n
    }

    /// Recompute framing state after bytes were appended.
    ///
    /// A header is parsed at most once per message. Zero-length frames carry
    /// nothing to deliver and are skipped so a frame queued behind them is
    /// still detected.
    pub fn update(&mut self) {
        if self.expected_length > 0 {
            self.ready = self.is_complete();
            return;
        }

        while self.held >= HEADER_LEN {
            self.expected_length = u16::from_be_bytes([self.storage[0], self.storage[1]]) as usize;
            self.storage.copy_within(HEADER_LEN..self.held, 0);
            self.held -= HEADER_LEN;

            if self.expected_length > 0 {
                break;
            }
        }

        self.ready = self.is_complete();
    }

    fn is_complete(&self) -> bool {
        self.expected_length > 0
            && self.expected_length <= MAX_MESSAGE_SIZE
            && self.held >= self.expected_length
    }

    /// Payload of the ready message, if any.
    pub fn message(&self) -> Option<&[u8]> {
        if self.ready {
            Some(&self.storage[..self.expected_length])
        } else {
            None
        }
    }

    /// Drop consumed bytes.
    ///
    /// With `force == false`, removes the ready message and keeps whatever
    /// follows it; call `update` afterwards to find a pipelined message.
    /// With `force == true`, discards everything, including a partial message.
    pub fn consume(&mut self, force: bool) {
        if force {
            self.held = 0;
            self.expected_length = 0;
            self.ready = false;
            self.storage.fill(0);
            return;
        }

        debug_assert!(self.ready, "consume without a ready message");
        if !self.ready {
            return;
        }

        self.storage.copy_within(self.expected_length..self.held, 0);
        self.held -= self.expected_length;
        self.expected_length = 0;
        self.ready = false;
    }

    /// Remove and return the ready message, then look for the next one.
    pub fn take_message(&mut self) -> Option<Bytes> {
        let message = Bytes::copy_from_slice(self.message()?);
        self.consume(false);
        self.update();
        Some(message)
    }
}

#[cfg(test)]
pub(crate) fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = encode_header(payload.len()).unwrap().to_vec();
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_message() {
        let mut buf = FramedBuffer::new();
        buf.append(&frame(b"hello"));

        assert!(buf.is_ready());
        assert_eq!(buf.expected_length(), 5);
        assert_eq!(buf.message(), Some(&b"hello"[..]));

        buf.consume(false);
        assert!(!buf.is_ready());
        assert_eq!(buf.held(), 0);
        assert_eq!(buf.expected_length(), 0);
    }

    #[test]
    fn test_max_size_message() {
        let payload: Vec<u8> = (0..MAX_MESSAGE_SIZE).map(|i| (i % 251) as u8).collect();
        let mut buf = FramedBuffer::new();
        buf.append(&frame(&payload));

        assert_eq!(buf.take_message().as_deref(), Some(&payload[..]));
        assert_eq!(buf.held(), 0);
    }

    #[test]
    fn test_pipelined_messages_in_one_read() {
        let mut wire = frame(b"first");
        wire.extend_from_slice(&frame(b"second"));

        let mut buf = FramedBuffer::new();
        buf.append(&wire);

        assert_eq!(buf.take_message().as_deref(), Some(&b"first"[..]));
        assert_eq!(buf.take_message().as_deref(), Some(&b"second"[..]));
        assert!(buf.take_message().is_none());
        assert_eq!(buf.held(), 0);
    }

    #[test]
    fn test_pipelined_messages_split_across_reads() {
        let mut wire = frame(b"alpha");
        wire.extend_from_slice(&frame(b"beta"));

        // Every split point, including ones inside both headers.
        for split in 1..wire.len() {
            let mut buf = FramedBuffer::new();
            let mut out = Vec::new();

            buf.append(&wire[..split]);
            while let Some(m) = buf.take_message() {
                out.push(m);
            }
            buf.append(&wire[split..]);
            while let Some(m) = buf.take_message() {
                out.push(m);
            }

            assert_eq!(out, vec![&b"alpha"[..], &b"beta"[..]], "split at {split}");
            assert_eq!(buf.held(), 0);
        }
    }

    #[test]
    fn test_partial_header() {
        let wire = frame(b"xyz");
        let mut buf = FramedBuffer::new();

        buf.append(&wire[..1]);
        assert!(!buf.is_ready());
        assert_eq!(buf.expected_length(), 0);
        assert_eq!(buf.held(), 1);

        buf.append(&wire[1..2]);
        assert!(!buf.is_ready());
        assert_eq!(buf.expected_length(), 3);
        assert_eq!(buf.held(), 0);

        buf.append(&wire[2..]);
        assert_eq!(buf.message(), Some(&b"xyz"[..]));
    }

    #[test]
    fn test_partial_payload() {
        let wire = frame(b"0123456789");
        let mut buf = FramedBuffer::new();

        buf.append(&wire[..6]);
        assert!(!buf.is_ready());
        assert_eq!(buf.expected_length(), 10);
        assert_eq!(buf.held(), 4);

        buf.append(&wire[6..]);
        assert!(buf.is_ready());
        assert_eq!(buf.held(), 10);
        assert_eq!(buf.message(), Some(&b"0123456789"[..]));
    }

    #[test]
    fn test_header_not_reparsed_mid_payload() {
        // Payload bytes that look like a huge header must not be re-read.
        let wire = frame(&[0xff, 0xff, b'a', b'b']);
        let mut buf = FramedBuffer::new();

        buf.append(&wire[..2]);
        buf.append(&wire[2..4]);
        assert_eq!(buf.expected_length(), 4);
        assert!(!buf.exceeds_limit());

        buf.append(&wire[4..]);
        assert_eq!(buf.message(), Some(&[0xff, 0xff, b'a', b'b'][..]));
    }

    #[test]
    fn test_one_byte_payload_after_bare_header() {
        let mut buf = FramedBuffer::new();
        buf.append(&[0, 1]);
        assert!(!buf.is_ready());

        buf.append(b"z");
        assert_eq!(buf.take_message().as_deref(), Some(&b"z"[..]));
    }

    #[test]
    fn test_oversized_header_never_ready() {
        let mut buf = FramedBuffer::new();
        buf.append(&1001u16.to_be_bytes());
        assert!(buf.exceeds_limit());
        assert!(!buf.is_ready());

        buf.append(&vec![b'x'; 1001]);
        assert!(!buf.is_ready());
        assert!(buf.message().is_none());
    }

    #[test]
    fn test_empty_frames_are_skipped() {
        let mut wire = frame(b"");
        wire.extend_from_slice(&frame(b""));
        wire.extend_from_slice(&frame(b"after"));

        let mut buf = FramedBuffer::new();
        buf.append(&wire);
        assert_eq!(buf.take_message().as_deref(), Some(&b"after"[..]));
        assert_eq!(buf.held(), 0);
    }

    #[test]
    fn test_force_consume_discards_partial_message() {
        let mut buf = FramedBuffer::new();
        buf.append(&frame(b"partial")[..5]);
        assert_eq!(buf.expected_length(), 7);

        buf.consume(true);
        assert_eq!(buf.held(), 0);
        assert_eq!(buf.expected_length(), 0);
        assert!(!buf.is_ready());

        // Buffer is reusable afterwards
        buf.append(&frame(b"next"));
        assert_eq!(buf.message(), Some(&b"next"[..]));
    }

    #[test]
    fn test_append_stops_at_capacity() {
        let mut buf = FramedBuffer::new();
        let copied = buf.append(&vec![0xffu8; BUFFER_CAPACITY + 10]);
        assert_eq!(copied, BUFFER_CAPACITY);
        assert!(buf.exceeds_limit());
        assert_eq!(buf.held(), BUFFER_CAPACITY - HEADER_LEN);
    }

    #[test]
    fn test_encode_header() {
        assert_eq!(encode_header(1001), None);
        assert_eq!(encode_header(1000), Some([0x03, 0xe8]));
        assert_eq!(encode_header(5), Some([0x00, 0x05]));
    }
}
