//! Single-threaded readiness runtime for the chat roles.
//!
//! Layers, leaves first:
//! - `FramedBuffer`: length-prefixed framing over a fixed byte region
//! - `io`: non-blocking reads and writes driving a buffer
//! - `ConnectionTable`: ordered client entries with two-phase removal
//! - `server` / `client`: mio reactor loops for each role
//!
//! Everything runs on the calling thread. The readiness wait is the only
//! place the reactor blocks.

mod buffer;
mod client;
mod connection;
mod dispatch;
mod io;
mod server;
mod token;

#[cfg(test)]
mod testing;

pub use client::Client;
pub use server::Server;

use std::time::Duration;

/// Upper bound on a single readiness wait, so shutdown requests are noticed.
pub(crate) const SHUTDOWN_TICK: Duration = Duration::from_millis(250);

/// Capacity of the readiness event list.
pub(crate) const EVENT_CAPACITY: usize = 128;

/// Lifecycle of a reactor loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorState {
    Running,
    Stopping(StopReason),
    Terminated,
}

/// Why a reactor left `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// No readiness for the whole idle timeout.
    IdleTimeout,
    /// A descriptor reported an error condition.
    ReadinessAnomaly,
    /// Shutdown flag raised by a signal.
    ShutdownRequested,
    /// The client's input reached EOF.
    InputClosed,
    /// The server went away (client role).
    ServerClosed,
    /// A fatal I/O error.
    Fatal,
}
