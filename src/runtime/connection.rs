//! Connection table for the reactor.
//!
//! Each accepted client gets a `ConnectionEntry` pairing its stream with its
//! own framing buffer and outbound queue. Entries are kept in acceptance
//! order, which is also the order broadcasts are delivered in.
//!
//! Closing is two-phase. `mark_closed` takes the stream out of its entry,
//! leaving a dead slot behind so indices stay stable while the reactor is
//! still walking the table. `compact` then removes every dead slot in one
//! order-preserving pass at the end of the iteration.
//!
//! Each entry's outbound queue is capped at `OUTBOUND_LIMIT`. A peer that
//! stops reading long enough to exceed it is flagged and dropped by the
//! reactor at the end of the pass.
//!
//! The listening socket never lives in the table; the reactor holds it under
//! `LISTENER_TOKEN`, so entry 0 here is the first client.

use crate::error::Result;
use crate::runtime::buffer::{FramedBuffer, BUFFER_CAPACITY};
use crate::runtime::io::{flush_pending, send_framed, SendProgress};
use bytes::BytesMut;
use mio::{Interest, Token};
use std::io::Write;
use tracing::debug;

/// Message sent to a client that arrives when the table is full.
pub const REJECTION_MESSAGE: &[u8] = b"server is full, try again later\n";

/// Most bytes an entry may have queued before it is treated as stalled.
pub const OUTBOUND_LIMIT: usize = 4 * BUFFER_CAPACITY;

/// A connection was turned away because the table is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("connection table full ({max_clients} clients)")]
pub struct Rejected {
    pub max_clients: usize,
}

/// A single client connection.
#[derive(Debug)]
pub struct ConnectionEntry<S> {
    /// `None` once the connection is closed and awaiting compaction.
    stream: Option<S>,
    token: Token,
    interest: Interest,
    buffer: FramedBuffer,
    outbound: BytesMut,
    overflowed: bool,
}

impl<S> ConnectionEntry<S> {
    /// Create a live entry watching for readable events.
    pub fn new(stream: S, token: Token) -> Self {
        Self {
            stream: Some(stream),
            token,
            interest: Interest::READABLE,
            buffer: FramedBuffer::new(),
            outbound: BytesMut::new(),
            overflowed: false,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// Whether the entry still owns an open stream.
    pub fn is_live(&self) -> bool {
        self.stream.is_some()
    }

    pub fn stream_mut(&mut self) -> Option<&mut S> {
        self.stream.as_mut()
    }

    #[cfg(test)]
    pub fn buffer(&self) -> &FramedBuffer {
        &self.buffer
    }

    /// Stream and framing buffer, borrowed together for a read pass.
    pub fn read_parts(&mut self) -> Option<(&mut S, &mut FramedBuffer)> {
        let stream = self.stream.as_mut()?;
        Some((stream, &mut self.buffer))
    }

    /// Readiness the entry is currently registered for.
    pub fn interest(&self) -> Interest {
        self.interest
    }

    pub fn set_interest(&mut self, interest: Interest) {
        self.interest = interest;
    }

    /// Readiness the entry needs given its outbound queue.
    pub fn desired_interest(&self) -> Interest {
        if self.outbound.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        }
    }

    /// Bytes queued but not yet accepted by the socket.
    pub fn pending_bytes(&self) -> usize {
        self.outbound.len()
    }

    /// Whether the outbound queue went past `OUTBOUND_LIMIT`.
    pub fn is_overflowed(&self) -> bool {
        self.overflowed
    }

    /// Take the stream out, leaving a dead slot. Discards any partial
    /// message and unsent output.
    fn close(&mut self) -> Option<S> {
        self.buffer.consume(true);
        self.outbound.clear();
        self.stream.take()
    }
}

impl<S: Write> ConnectionEntry<S> {
    /// Queue a framed copy of `payload` and write what the socket accepts.
    ///
    /// Dead entries silently drop the message. Once the queue has overflowed,
    /// further messages are dropped too and the entry stays `Blocked`.
    pub fn send(&mut self, payload: &[u8]) -> Result<SendProgress> {
        if self.overflowed {
            return Ok(SendProgress::Blocked);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(SendProgress::Complete);
        };

        let progress = send_framed(stream, &mut self.outbound, payload)?;
        if self.outbound.len() > OUTBOUND_LIMIT {
            self.overflowed = true;
        }
        Ok(progress)
    }

    /// Retry queued output after the socket became writable.
    pub fn flush(&mut self) -> Result<SendProgress> {
        match self.stream.as_mut() {
            Some(stream) => flush_pending(stream, &mut self.outbound),
            None => Ok(SendProgress::Complete),
        }
    }
}

/// Entries other than the one whose message is being dispatched.
pub struct Peers<'a, S> {
    before: &'a mut [ConnectionEntry<S>],
    after: &'a mut [ConnectionEntry<S>],
}

impl<'a, S> Peers<'a, S> {
    /// Live peers in table order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ConnectionEntry<S>> {
        self.before
            .iter_mut()
            .chain(self.after.iter_mut())
            .filter(|entry| entry.is_live())
    }
}

/// Ordered table of client connections.
#[derive(Debug)]
pub struct ConnectionTable<S> {
    entries: Vec<ConnectionEntry<S>>,
    max_clients: usize,
}

impl<S> ConnectionTable<S> {
    /// Create a table admitting at most `max_clients` connections.
    pub fn new(max_clients: usize) -> Self {
        Self {
            entries: Vec::with_capacity(max_clients),
            max_clients,
        }
    }

    /// Number of slots, including dead ones not yet compacted.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    pub fn get(&self, index: usize) -> Option<&ConnectionEntry<S>> {
        self.entries.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut ConnectionEntry<S>> {
        self.entries.get_mut(index)
    }

    /// Index of the live entry registered under `token`.
    pub fn position(&self, token: Token) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.is_live() && entry.token == token)
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = &ConnectionEntry<S>> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ConnectionEntry<S>> {
        self.entries.iter_mut()
    }

    /// Borrow one entry alongside every other entry.
    pub fn split_at(&mut self, index: usize) -> Option<(&mut ConnectionEntry<S>, Peers<'_, S>)> {
        if index >= self.entries.len() {
            return None;
        }
        let (before, rest) = self.entries.split_at_mut(index);
        let (entry, after) = rest.split_first_mut()?;
        Some((entry, Peers { before, after }))
    }

    /// Mark the entry at `index` closed and hand back its stream.
    ///
    /// The slot stays in place until the next `compact`.
    pub fn mark_closed(&mut self, index: usize) -> Option<S> {
        self.entries.get_mut(index)?.close()
    }

    /// Indices of live entries whose outbound queue overflowed.
    pub fn overflowed(&self) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_live() && entry.is_overflowed())
            .map(|(index, _)| index)
            .collect()
    }

    /// Close every live entry, returning their tokens and streams.
    pub fn close_all(&mut self) -> Vec<(Token, S)> {
        self.entries
            .iter_mut()
            .filter_map(|entry| entry.close().map(|stream| (entry.token, stream)))
            .collect()
    }

    /// Remove dead slots, keeping survivors in acceptance order.
    ///
    /// Returns the tokens of the removed entries so they can be recycled.
    pub fn compact(&mut self) -> Vec<Token> {
        let mut removed = Vec::new();
        self.entries.retain(|entry| {
            if entry.is_live() {
                true
            } else {
                removed.push(entry.token);
                false
            }
        });
        removed
    }
}

impl<S: Write> ConnectionTable<S> {
    /// Append a newly accepted stream, or turn it away when the table is full.
    ///
    /// A rejected stream receives `REJECTION_MESSAGE` once, framed like any
    /// other message, and is then closed. Returns the new entry's index.
    pub fn accept_into(
        &mut self,
        mut stream: S,
        token: Token,
    ) -> std::result::Result<usize, Rejected> {
        if self.entries.len() >= self.max_clients {
            let mut pending = BytesMut::new();
            match send_framed(&mut stream, &mut pending, REJECTION_MESSAGE) {
                Ok(SendProgress::Complete) => {}
                Ok(SendProgress::Blocked) => debug!("rejection message only partially sent"),
                Err(e) => debug!(error = %e, "failed to send rejection message"),
            }
            drop(stream);
            return Err(Rejected {
                max_clients: self.max_clients,
            });
        }

        self.entries.push(ConnectionEntry::new(stream, token));
        Ok(self.entries.len() - 1)
    }
}
