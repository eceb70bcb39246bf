//! Non-blocking socket I/O driving a `FramedBuffer`.
//!
//! Reads drain a socket until it would block, handing every completed
//! message to a `Dispatch` policy as soon as its framing completes. Writes
//! go through a per-connection outbound queue: whatever the socket does not
//! accept right away stays queued until the reactor reports the socket
//! writable again, so one stalled peer never spins the thread.
//!
//! Error policy: `WouldBlock` and `Interrupted` are transient and never
//! surface. A zero-length read or an oversized header ends the connection
//! through `ConnectionOutcome`. Every other I/O error is fatal.

use crate::error::{ChatError, Result};
use crate::runtime::buffer::{encode_header, FramedBuffer, HEADER_LEN, MAX_MESSAGE_SIZE};
use bytes::{Buf, Bytes, BytesMut};
use std::io::{self, Read, Write};

/// How a connection stands after a read pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOutcome {
    /// Socket drained, connection stays open.
    Continuing,
    /// Peer closed its end (zero-length read).
    PeerClosed,
    /// Peer declared a message larger than `MAX_MESSAGE_SIZE`.
    Violation {
        /// Length taken from the offending header.
        declared: usize,
    },
}

impl ConnectionOutcome {
    /// Whether the connection must be torn down.
    pub fn is_closed(&self) -> bool {
        !matches!(self, ConnectionOutcome::Continuing)
    }
}

/// Progress of an outbound queue after a write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendProgress {
    /// Everything queued has been written.
    Complete,
    /// The socket would block; bytes remain queued.
    Blocked,
}

/// Consumer of completed messages.
///
/// The role decides what happens to a message: the client prints it, the
/// server relays it to every other peer. An error returned here is fatal
/// and aborts the read pass.
pub trait Dispatch {
    fn dispatch(&mut self, message: Bytes) -> Result<()>;
}

/// Collect messages instead of delivering them.
impl Dispatch for Vec<Bytes> {
    fn dispatch(&mut self, message: Bytes) -> Result<()> {
        self.push(message);
        Ok(())
    }
}

/// Read from `stream` until it would block, dispatching each completed message.
///
/// Messages are dispatched in the order their framing completes. When the
/// peer closes or violates the size limit, messages completed before that
/// point have already been dispatched.
pub fn drain<S, D>(
    stream: &mut S,
    buf: &mut FramedBuffer,
    dispatch: &mut D,
) -> Result<ConnectionOutcome>
where
    S: Read + ?Sized,
    D: Dispatch + ?Sized,
{
    loop {
        // Cannot happen while the capacity exceeds a full frame, since every
        // ready message is consumed before the next read.
        if buf.spare_mut().is_empty() {
            return Ok(ConnectionOutcome::Violation {
                declared: buf.expected_length(),
            });
        }

        match stream.read(buf.spare_mut()) {
            Ok(0) => return Ok(ConnectionOutcome::PeerClosed),
            Ok(n) => {
                buf.advance(n);
                buf.update();

                while let Some(message) = buf.take_message() {
                    dispatch.dispatch(message)?;
                }

                if buf.exceeds_limit() {
                    return Ok(ConnectionOutcome::Violation {
                        declared: buf.expected_length(),
                    });
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Ok(ConnectionOutcome::Continuing);
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ChatError::io("recv()", e)),
        }
    }
}

/// Frame `payload`, queue it behind anything already pending and write as
/// much as the socket accepts.
pub fn send_framed<S>(
    stream: &mut S,
    pending: &mut BytesMut,
    payload: &[u8],
) -> Result<SendProgress>
where
    S: Write + ?Sized,
{
    let header = encode_header(payload.len()).ok_or(ChatError::MessageTooLarge {
        len: payload.len(),
        max: MAX_MESSAGE_SIZE,
    })?;

    pending.reserve(HEADER_LEN + payload.len());
    pending.extend_from_slice(&header);
    pending.extend_from_slice(payload);

    flush_pending(stream, pending)
}

/// Write queued bytes until the queue is empty or the socket would block.
pub fn flush_pending<S>(stream: &mut S, pending: &mut BytesMut) -> Result<SendProgress>
where
    S: Write + ?Sized,
{
    while !pending.is_empty() {
        match stream.write(&pending[..]) {
            Ok(0) => {
                return Err(ChatError::io(
                    "send()",
                    io::Error::new(io::ErrorKind::WriteZero, "send returned 0"),
                ));
            }
            Ok(n) => pending.advance(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Ok(SendProgress::Blocked);
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ChatError::io("send()", e)),
        }
    }
    Ok(SendProgress::Complete)
}
