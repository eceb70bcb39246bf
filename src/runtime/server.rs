//! Server reactor loop.
//!
//! Readiness-based model: mio tells us which sockets are ready, then we run
//! non-blocking reads and writes against them. One pass per wakeup:
//!
//! 1. Wait for readiness (bounded by the idle timeout).
//! 2. Any descriptor reporting an error condition stops the server.
//! 3. A readable listener accepts until `accept` would block.
//! 4. Readable clients are drained; every completed message is relayed to
//!    every other client. Writable clients flush their outbound queue.
//! 5. Clients whose outbound queue overflowed are dropped.
//! 6. Registrations follow each entry's outbound queue, then closed entries
//!    are compacted out of the table.

use crate::config::ServerConfig;
use crate::error::{ChatError, IoContext, Result};
use crate::runtime::connection::ConnectionTable;
use crate::runtime::dispatch::Broadcast;
use crate::runtime::io::{drain, ConnectionOutcome};
use crate::runtime::token::{TokenAllocator, LISTENER_TOKEN};
use crate::runtime::{ReactorState, StopReason, EVENT_CAPACITY, SHUTDOWN_TICK};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Readiness reported for one token during a pass.
#[derive(Debug, Clone, Copy)]
struct Ready {
    token: Token,
    readable: bool,
    writable: bool,
}

/// Broadcast chat server.
pub struct Server {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    table: ConnectionTable<TcpStream>,
    tokens: TokenAllocator,
    idle_timeout: Option<std::time::Duration>,
    shutdown: Arc<AtomicBool>,
    state: ReactorState,
}

impl Server {
    /// Bind the listening socket and set up the reactor.
    pub fn bind(config: &ServerConfig, shutdown: Arc<AtomicBool>) -> Result<Self> {
        let addr = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .op("getaddrinfo()")?
            .next()
            .ok_or_else(|| ChatError::Resolve(format!("{}:{}", config.host, config.port)))?;

        let poll = Poll::new().op("poll()")?;
        let mut listener = TcpListener::from_std(create_listener(addr, config.max_clients)?);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .op("register()")?;

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            listener,
            table: ConnectionTable::new(config.max_clients),
            tokens: TokenAllocator::new(config.max_clients),
            idle_timeout: config.idle_timeout,
            shutdown,
            state: ReactorState::Running,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().op("getsockname()")
    }

    #[cfg(test)]
    pub fn state(&self) -> ReactorState {
        self.state
    }

    /// Run until idle timeout, readiness anomaly, shutdown request or a
    /// fatal error. Every connection is closed before returning.
    pub fn run(&mut self) -> Result<()> {
        info!(
            addr = %self.local_addr()?,
            max_clients = self.table.max_clients(),
            idle_timeout = ?self.idle_timeout,
            "Server listening"
        );

        let result = self.event_loop();
        if let Err(ref e) = result {
            error!(error = %e, "Fatal error, closing all connections");
            self.state = ReactorState::Stopping(StopReason::Fatal);
        }

        self.close_all();
        result
    }

    fn event_loop(&mut self) -> Result<()> {
        let mut last_activity = Instant::now();

        while self.state == ReactorState::Running {
            if self.shutdown.load(Ordering::SeqCst) {
                info!("Shutdown requested");
                self.state = ReactorState::Stopping(StopReason::ShutdownRequested);
                break;
            }

            let mut timeout = SHUTDOWN_TICK;
            if let Some(idle) = self.idle_timeout {
                let left = idle.saturating_sub(last_activity.elapsed());
                if left.is_zero() {
                    info!(timeout = ?idle, "No activity, exiting");
                    self.state = ReactorState::Stopping(StopReason::IdleTimeout);
                    break;
                }
                timeout = timeout.min(left);
            }

            match self.poll.poll(&mut self.events, Some(timeout)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ChatError::io("poll()", e)),
            }

            if self.events.is_empty() {
                continue;
            }
            last_activity = Instant::now();

            self.process_events()?;
        }

        Ok(())
    }

    /// One dispatch pass over the events of the last wait.
    fn process_events(&mut self) -> Result<()> {
        let mut listener_ready = false;
        let mut ready = Vec::with_capacity(self.events.iter().count());

        for event in self.events.iter() {
            if event.is_error() {
                warn!(token = event.token().0, "Unexpected readiness event");
                self.state = ReactorState::Stopping(StopReason::ReadinessAnomaly);
                return Ok(());
            }

            if event.token() == LISTENER_TOKEN {
                listener_ready = event.is_readable();
                continue;
            }

            ready.push(Ready {
                token: event.token(),
                readable: event.is_readable() || event.is_read_closed(),
                writable: event.is_writable(),
            });
        }

        if listener_ready {
            self.accept_connections()?;
        }

        // Serve ready clients in acceptance order; indices stay stable until compaction.
        let mut ready: Vec<(usize, Ready)> = ready
            .into_iter()
            .filter_map(|r| self.table.position(r.token).map(|index| (index, r)))
            .collect();
        ready.sort_unstable_by_key(|(index, _)| *index);

        for (index, r) in ready {
            if r.readable {
                self.handle_readable(index)?;
            }
            if r.writable {
                if let Some(entry) = self.table.get_mut(index) {
                    entry.flush()?;
                }
            }
        }

        for index in self.table.overflowed() {
            warn!(
                token = self.table.get(index).map(|e| e.token().0),
                "Client is not reading, dropping it"
            );
            self.close_connection(index);
        }

        self.sync_interests()?;
        for token in self.table.compact() {
            self.tokens.free(token);
        }

        Ok(())
    }

    fn accept_connections(&mut self) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer)?,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    continue
                }
                Err(e) => return Err(ChatError::io("accept()", e)),
            }
        }
    }

    /// Add an accepted stream to the table and register it.
    ///
    /// mio hands out accepted streams already in non-blocking mode.
    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let fd = stream.as_raw_fd();
        let token = self.tokens.alloc(fd);

        match self.table.accept_into(stream, token) {
            Ok(index) => {
                if let Some(stream) = self.table.get_mut(index).and_then(|e| e.stream_mut()) {
                    self.poll
                        .registry()
                        .register(stream, token, Interest::READABLE)
                        .op("register()")?;
                }
                debug!(token = token.0, fd, peer = %peer, "New incoming connection");
            }
            Err(rejected) => {
                self.tokens.free(token);
                warn!(peer = %peer, max_clients = rejected.max_clients, "Rejected connection");
            }
        }
        Ok(())
    }

    fn handle_readable(&mut self, index: usize) -> Result<()> {
        let Some((entry, peers)) = self.table.split_at(index) else {
            return Ok(());
        };
        let token = entry.token();
        let Some((stream, buffer)) = entry.read_parts() else {
            return Ok(());
        };

        let mut broadcast = Broadcast::new(token, peers);
        let outcome = drain(stream, buffer, &mut broadcast)?;
        match outcome {
            ConnectionOutcome::Continuing => {}
            ConnectionOutcome::PeerClosed => debug!(token = token.0, "Connection closed by peer"),
            ConnectionOutcome::Violation { declared } => warn!(
                token = token.0,
                declared, "Message exceeds allowed length, dropping client"
            ),
        }
        if outcome.is_closed() {
            self.close_connection(index);
        }
        Ok(())
    }

    fn close_connection(&mut self, index: usize) {
        let Some(token) = self.table.get(index).map(|entry| entry.token()) else {
            return;
        };
        if let Some(mut stream) = self.table.mark_closed(index) {
            let _ = self.poll.registry().deregister(&mut stream);
            debug!(token = token.0, fd = self.tokens.get(token), "Closed connection");
        }
    }

    /// Register interest in writability exactly for entries with queued output.
    fn sync_interests(&mut self) -> Result<()> {
        for entry in self.table.iter_mut() {
            let desired = entry.desired_interest();
            if desired == entry.interest() {
                continue;
            }
            let token = entry.token();
            if let Some(stream) = entry.stream_mut() {
                self.poll
                    .registry()
                    .reregister(stream, token, desired)
                    .op("reregister()")?;
            }
            entry.set_interest(desired);
        }
        Ok(())
    }

    /// Shut down every client and stop listening.
    pub fn close_all(&mut self) {
        let closed = self.table.close_all();
        let count = closed.len();
        for (_, mut stream) in closed {
            let _ = self.poll.registry().deregister(&mut stream);
            let _ = stream.shutdown(Shutdown::Both);
        }
        for token in self.table.compact() {
            self.tokens.free(token);
        }
        let _ = self.poll.registry().deregister(&mut self.listener);

        if self.state != ReactorState::Terminated {
            info!(connections = count, reason = ?self.state, "Server stopped");
        }
        self.state = ReactorState::Terminated;
    }
}

/// Create a non-blocking TCP listener.
fn create_listener(addr: SocketAddr, backlog: usize) -> Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .op("socket()")?;

    socket.set_reuse_address(true).op("setsockopt()")?;
    socket.set_nonblocking(true).op("fcntl()")?;
    socket.bind(&addr.into()).op("bind()")?;
    socket
        .listen(backlog.clamp(1, i32::MAX as usize) as i32)
        .op("listen()")?;

    Ok(socket.into())
}
