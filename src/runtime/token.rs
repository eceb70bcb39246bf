//! Readiness token allocation for table entries.
//!
//! An entry's index in the connection table shifts whenever an earlier entry
//! is compacted away, so readiness registrations use a token that stays put
//! for the lifetime of the connection. Tokens are recycled once their
//! connection has been removed from the table.

use mio::Token;
use slab::Slab;
use std::os::unix::io::RawFd;

/// Token of the listening socket.
pub const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Token of the client's standard input.
pub const STDIN_TOKEN: Token = Token(usize::MAX - 1);

/// Allocator for connection tokens with O(1) lookup.
///
/// Each live token remembers the descriptor it was issued for, which is
/// what log lines report.
pub struct TokenAllocator {
    slots: Slab<RawFd>,
}

impl TokenAllocator {
    /// Create an allocator sized for `capacity` live connections.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Slab::with_capacity(capacity),
        }
    }

    /// Issue a token for a freshly accepted descriptor.
    pub fn alloc(&mut self, fd: RawFd) -> Token {
        Token(self.slots.insert(fd))
    }

    /// Descriptor a live token was issued for.
    pub fn get(&self, token: Token) -> Option<RawFd> {
        self.slots.get(token.0).copied()
    }

    /// Release a token, making it available for reuse.
    pub fn free(&mut self, token: Token) -> Option<RawFd> {
        self.slots.try_remove(token.0)
    }

    /// Number of live tokens.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_allocator() {
        let mut tokens = TokenAllocator::new(4);

        let t1 = tokens.alloc(7);
        let t2 = tokens.alloc(8);
        assert_ne!(t1, t2);
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens.get(t2), Some(8));

        assert_eq!(tokens.free(t1), Some(7));
        assert!(tokens.get(t1).is_none());
        assert_eq!(tokens.free(t1), None);

        // Freed slots are reused
        let t3 = tokens.alloc(9);
        assert_eq!(t3, t1);
        assert_eq!(tokens.get(t3), Some(9));
    }

    #[test]
    fn test_tokens_never_collide_with_reserved() {
        let mut tokens = TokenAllocator::new(2);
        for fd in 0..32 {
            let t = tokens.alloc(fd);
            assert_ne!(t, LISTENER_TOKEN);
            assert_ne!(t, STDIN_TOKEN);
        }
        assert!(!tokens.is_empty());
    }
}
