//! Dispatch policies for completed messages.

use crate::error::{IoContext, Result};
use crate::runtime::connection::Peers;
use crate::runtime::io::{Dispatch, SendProgress};
use bytes::Bytes;
use mio::Token;
use std::io::Write;
use tracing::trace;

/// Client policy: write each payload, unframed, to an output stream.
pub struct EchoToOutput<W> {
    out: W,
}

impl<W: Write> EchoToOutput<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Dispatch for EchoToOutput<W> {
    fn dispatch(&mut self, message: Bytes) -> Result<()> {
        self.out.write_all(&message).op("write()")?;
        self.out.flush().op("flush()")
    }
}

/// Server policy: relay each payload to every live peer except its sender.
///
/// Peers receive the message in table order. A fatal send error stops the
/// relay of that message at the failing peer.
pub struct Broadcast<'a, S> {
    origin: Token,
    peers: Peers<'a, S>,
}

impl<'a, S> Broadcast<'a, S> {
    pub fn new(origin: Token, peers: Peers<'a, S>) -> Self {
        Self { origin, peers }
    }
}

impl<S: Write> Dispatch for Broadcast<'_, S> {
    fn dispatch(&mut self, message: Bytes) -> Result<()> {
        let mut delivered = 0usize;
        let mut queued = 0usize;

        for peer in self.peers.iter_mut() {
            match peer.send(&message)? {
                SendProgress::Complete => delivered += 1,
                SendProgress::Blocked => queued += 1,
            }
        }

        trace!(
            origin = self.origin.0,
            bytes = message.len(),
            delivered,
            queued,
            "relayed message"
        );
        Ok(())
    }
}
