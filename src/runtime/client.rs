//! Client reactor loop.
//!
//! Waits on two sources at once: the input descriptor (normally stdin) and
//! the server socket. Input is cut into lines and each line goes out as one
//! framed message. Messages relayed by the server are written to the output
//! stream as they complete.
//!
//! Input that the poller refuses (regular files, `/dev/null`) is always
//! readable and is read directly each pass instead. Either way, reading
//! pauses while the socket's outbound queue holds half of `OUTBOUND_LIMIT`.

use crate::config::ClientConfig;
use crate::error::{ChatError, IoContext, Result};
use crate::runtime::buffer::MAX_MESSAGE_SIZE;
use crate::runtime::connection::{ConnectionEntry, OUTBOUND_LIMIT};
use crate::runtime::dispatch::EchoToOutput;
use crate::runtime::io::{drain, ConnectionOutcome};
use crate::runtime::token::STDIN_TOKEN;
use crate::runtime::{ReactorState, StopReason, EVENT_CAPACITY, SHUTDOWN_TICK};
use bytes::{Bytes, BytesMut};
use mio::net::TcpStream;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const SERVER_TOKEN: Token = Token(0);

/// Notice shown when the server connection ends.
const DISCONNECT_NOTICE: &str = "connection to server closed";

/// Queued bytes at which input reading pauses until the socket drains.
const INPUT_PAUSE: usize = OUTBOUND_LIMIT / 2;

/// Input descriptor switched to non-blocking mode for the client's lifetime.
///
/// The original file status flags are restored on drop, since stdin is
/// usually shared with the parent shell.
struct Input {
    fd: RawFd,
    saved_flags: libc::c_int,
    /// Registered with the poller; otherwise always readable.
    polled: bool,
    /// May have data that has not been read yet.
    pending: bool,
}

impl Input {
    fn new(fd: RawFd) -> io::Result<Self> {
        // SAFETY: fcntl on a caller-supplied descriptor has no memory effects.
        let saved_flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if saved_flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFL, saved_flags | libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fd,
            saved_flags,
            polled: false,
            pending: true,
        })
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: `buf` is valid for writes of `buf.len()` bytes.
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

impl Drop for Input {
    fn drop(&mut self) {
        // SAFETY: fcntl on a descriptor we were handed has no memory effects.
        if unsafe { libc::fcntl(self.fd, libc::F_SETFL, self.saved_flags) } < 0 {
            debug!(
                fd = self.fd,
                error = %io::Error::last_os_error(),
                "Failed to restore input flags"
            );
        }
    }
}

/// Cuts an input byte stream into messages.
///
/// A message ends after a newline, or after `MAX_MESSAGE_SIZE` bytes when a
/// line is longer than that.
#[derive(Debug, Default)]
struct LineAssembler {
    pending: BytesMut,
}

impl LineAssembler {
    fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.pending.extend_from_slice(data);

        let mut lines = Vec::new();
        loop {
            let window = self.pending.len().min(MAX_MESSAGE_SIZE);
            let cut = match self.pending[..window].iter().position(|&b| b == b'\n') {
                Some(pos) => pos + 1,
                None if self.pending.len() >= MAX_MESSAGE_SIZE => MAX_MESSAGE_SIZE,
                None => break,
            };
            lines.push(self.pending.split_to(cut).freeze());
        }
        lines
    }

    /// Whatever is left once the input ends.
    fn finish(&mut self) -> Option<Bytes> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.pending.split().freeze())
        }
    }
}

/// Broadcast chat client.
pub struct Client<W: Write> {
    poll: Poll,
    events: Events,
    server: ConnectionEntry<TcpStream>,
    peer: SocketAddr,
    input: Option<Input>,
    lines: LineAssembler,
    output: EchoToOutput<W>,
    shutdown: Arc<AtomicBool>,
    state: ReactorState,
}

impl<W: Write> Client<W> {
    /// Connect to the server and register the server socket and `input_fd`.
    pub fn connect(
        config: &ClientConfig,
        input_fd: RawFd,
        output: W,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let target = format!("{}:{}", config.host, config.port);
        let addrs: Vec<SocketAddr> = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|_| ChatError::Resolve(target.clone()))?
            .collect();
        let peer = addrs
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or(ChatError::Resolve(target))?;

        let stream = std::net::TcpStream::connect(peer).op("connect()")?;
        stream.set_nonblocking(true).op("fcntl()")?;
        let mut stream = TcpStream::from_std(stream);

        let poll = Poll::new().op("poll()")?;
        poll.registry()
            .register(&mut stream, SERVER_TOKEN, Interest::READABLE)
            .op("register()")?;

        let mut input = Input::new(input_fd).op("fcntl()")?;
        match poll
            .registry()
            .register(&mut SourceFd(&input.fd), STDIN_TOKEN, Interest::READABLE)
        {
            Ok(()) => input.polled = true,
            // epoll refuses regular files
            Err(ref e) if e.kind() == io::ErrorKind::PermissionDenied => {
                debug!(fd = input_fd, "Input cannot be polled, reading it directly");
            }
            Err(e) => return Err(ChatError::io("register()", e)),
        }

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            server: ConnectionEntry::new(stream, SERVER_TOKEN),
            peer,
            input: Some(input),
            lines: LineAssembler::default(),
            output: EchoToOutput::new(output),
            shutdown,
            state: ReactorState::Running,
        })
    }

    #[cfg(test)]
    pub fn state(&self) -> ReactorState {
        self.state
    }

    /// Run until input ends, the server goes away, shutdown is requested or
    /// a fatal error occurs.
    pub fn run(&mut self) -> Result<()> {
        info!(peer = %self.peer, "Connected");

        let result = self.event_loop();
        if let Err(ref e) = result {
            error!(error = %e, "Fatal error, closing connection");
            self.state = ReactorState::Stopping(StopReason::Fatal);
        }

        self.close_all();
        result
    }

    fn event_loop(&mut self) -> Result<()> {
        while self.state == ReactorState::Running {
            if self.shutdown.load(Ordering::SeqCst) {
                info!("Shutdown requested");
                self.state = ReactorState::Stopping(StopReason::ShutdownRequested);
                break;
            }

            if self.input.as_ref().is_some_and(|input| input.pending) {
                self.read_input()?;
                self.sync_interest()?;
            }

            // Input is done once everything read from it reached the socket
            if self.input.is_none() && self.server.pending_bytes() == 0 {
                debug!("Input closed");
                self.state = ReactorState::Stopping(StopReason::InputClosed);
                break;
            }

            match self.poll.poll(&mut self.events, Some(SHUTDOWN_TICK)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ChatError::io("poll()", e)),
            }

            let mut ready = Vec::new();
            for event in self.events.iter() {
                if event.is_error() {
                    warn!(token = event.token().0, "Unexpected readiness event");
                    self.state = ReactorState::Stopping(StopReason::ReadinessAnomaly);
                    return Ok(());
                }
                ready.push((
                    event.token(),
                    event.is_readable() || event.is_read_closed(),
                    event.is_writable(),
                ));
            }

            for (token, readable, writable) in ready {
                match token {
                    STDIN_TOKEN if readable => {
                        if let Some(input) = self.input.as_mut() {
                            input.pending = true;
                        }
                        self.read_input()?;
                    }
                    SERVER_TOKEN => {
                        if readable {
                            self.read_server()?;
                        }
                        if writable && self.state == ReactorState::Running {
                            self.server.flush()?;
                        }
                    }
                    _ => {}
                }
                if self.state != ReactorState::Running {
                    return Ok(());
                }
            }

            self.sync_interest()?;
        }

        Ok(())
    }

    /// Read input until it would block or the outbound queue is backed up,
    /// sending every completed line.
    fn read_input(&mut self) -> Result<()> {
        let mut chunk = [0u8; MAX_MESSAGE_SIZE];
        loop {
            if self.server.pending_bytes() >= INPUT_PAUSE {
                return Ok(());
            }
            let Some(input) = self.input.as_mut() else {
                return Ok(());
            };

            match input.read(&mut chunk) {
                Ok(0) => {
                    if let Some(rest) = self.lines.finish() {
                        self.server.send(&rest)?;
                    }
                    self.close_input();
                    return Ok(());
                }
                Ok(n) => {
                    for line in self.lines.push(&chunk[..n]) {
                        self.server.send(&line)?;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    input.pending = false;
                    return Ok(());
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ChatError::io("read()", e)),
            }
        }
    }

    fn read_server(&mut self) -> Result<()> {
        let Some((stream, buffer)) = self.server.read_parts() else {
            return Ok(());
        };

        match drain(stream, buffer, &mut self.output)? {
            ConnectionOutcome::Continuing => {}
            ConnectionOutcome::PeerClosed => {
                eprintln!("{DISCONNECT_NOTICE}");
                self.state = ReactorState::Stopping(StopReason::ServerClosed);
            }
            ConnectionOutcome::Violation { declared } => {
                warn!(declared, "Server sent a message exceeding the allowed length");
                eprintln!("{DISCONNECT_NOTICE}");
                self.state = ReactorState::Stopping(StopReason::ServerClosed);
            }
        }
        Ok(())
    }

    fn sync_interest(&mut self) -> Result<()> {
        let desired = self.server.desired_interest();
        if desired == self.server.interest() {
            return Ok(());
        }
        if let Some(stream) = self.server.stream_mut() {
            self.poll
                .registry()
                .reregister(stream, SERVER_TOKEN, desired)
                .op("reregister()")?;
        }
        self.server.set_interest(desired);
        Ok(())
    }

    fn close_input(&mut self) {
        if let Some(input) = self.input.take() {
            if input.polled {
                let _ = self.poll.registry().deregister(&mut SourceFd(&input.fd));
            }
        }
    }

    /// Stop reading input and shut the server connection down.
    pub fn close_all(&mut self) {
        self.close_input();
        if let Some(stream) = self.server.stream_mut() {
            let _ = self.poll.registry().deregister(stream);
            let _ = stream.shutdown(Shutdown::Both);
        }
        debug!(reason = ?self.state, "Client stopped");
        self.state = ReactorState::Terminated;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::runtime::buffer::frame;
    use crate::runtime::Server;
    use std::fs::File;
    use std::io::Read;
    use std::net::TcpStream as StdStream;
    use std::os::unix::io::{FromRawFd, IntoRawFd};
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct SharedOutput(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedOutput {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Pipe standing in for stdin: (read fd, write end).
    fn input_pipe() -> (RawFd, File) {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], unsafe { File::from_raw_fd(fds[1]) })
    }

    fn start_server() -> (SocketAddr, Arc<AtomicBool>, thread::JoinHandle<Result<()>>) {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_clients: 8,
            idle_timeout: None,
        };
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut server = Server::bind(&config, Arc::clone(&shutdown)).unwrap();
        let addr = server.local_addr().unwrap();
        (addr, shutdown, thread::spawn(move || server.run()))
    }

    fn client_config(addr: SocketAddr) -> ClientConfig {
        ClientConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }

    fn read_message(stream: &mut StdStream) -> Vec<u8> {
        let mut header = [0u8; 2];
        stream.read_exact(&mut header).unwrap();
        let mut payload = vec![0u8; u16::from_be_bytes(header) as usize];
        stream.read_exact(&mut payload).unwrap();
        payload
    }

    #[test]
    fn test_line_assembler_splits_lines() {
        let mut lines = LineAssembler::default();
        assert!(lines.push(b"hel").is_empty());
        assert_eq!(lines.push(b"lo\nwor"), vec![&b"hello\n"[..]]);
        assert_eq!(lines.push(b"ld\n\n"), vec![&b"world\n"[..], &b"\n"[..]]);
        assert!(lines.finish().is_none());
    }

    #[test]
    fn test_line_assembler_chunks_long_lines() {
        let mut lines = LineAssembler::default();
        let mut long = vec![b'a'; MAX_MESSAGE_SIZE + 5];
        long.push(b'\n');

        let out = lines.push(&long);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].len(), MAX_MESSAGE_SIZE);
        assert_eq!(&out[1][..], b"aaaaa\n");
    }

    #[test]
    fn test_line_assembler_finish_flushes_partial_line() {
        let mut lines = LineAssembler::default();
        assert!(lines.push(b"no newline").is_empty());
        assert_eq!(lines.finish().as_deref(), Some(&b"no newline"[..]));
        assert!(lines.finish().is_none());
    }

    #[test]
    fn test_client_sends_lines_and_prints_relayed() {
        let (addr, server_shutdown, server) = start_server();
        let mut observer = StdStream::connect(addr).unwrap();
        observer
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        thread::sleep(Duration::from_millis(100));

        let (input_fd, mut input) = input_pipe();
        let output = SharedOutput::default();
        let mut client = Client::connect(
            &client_config(addr),
            input_fd,
            output.clone(),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        let handle = thread::spawn(move || {
            let result = client.run();
            (result, client.state())
        });

        input.write_all(b"hello\n").unwrap();
        assert_eq!(read_message(&mut observer), b"hello\n");

        observer.write_all(&frame(b"hi there\n")).unwrap();
        thread::sleep(Duration::from_millis(300));

        input.write_all(b"bye").unwrap();
        drop(input);
        let (result, state) = handle.join().unwrap();
        assert!(result.is_ok());
        assert_eq!(state, ReactorState::Terminated);

        // Trailing partial line is sent once input ends
        assert_eq!(read_message(&mut observer), b"bye");
        assert_eq!(&output.0.lock().unwrap()[..], b"hi there\n");

        unsafe { libc::close(input_fd) };
        server_shutdown.store(true, Ordering::SeqCst);
        server.join().unwrap().unwrap();
    }

    #[test]
    fn test_client_stops_when_server_goes_away() {
        let (addr, server_shutdown, server) = start_server();
        let (input_fd, input) = input_pipe();
        let mut client = Client::connect(
            &client_config(addr),
            input_fd,
            SharedOutput::default(),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        let handle = thread::spawn(move || client.run());

        thread::sleep(Duration::from_millis(100));
        server_shutdown.store(true, Ordering::SeqCst);
        server.join().unwrap().unwrap();

        assert!(handle.join().unwrap().is_ok());
        drop(input);
        unsafe { libc::close(input_fd) };
    }

    #[test]
    fn test_client_reads_file_input() {
        let (addr, server_shutdown, server) = start_server();
        let mut observer = StdStream::connect(addr).unwrap();
        observer
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        thread::sleep(Duration::from_millis(100));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"one\ntwo\nthree").unwrap();
        let input_fd = File::open(file.path()).unwrap().into_raw_fd();

        let mut client = Client::connect(
            &client_config(addr),
            input_fd,
            SharedOutput::default(),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        let handle = thread::spawn(move || {
            let result = client.run();
            (result, client.state())
        });

        assert_eq!(read_message(&mut observer), b"one\n");
        assert_eq!(read_message(&mut observer), b"two\n");
        assert_eq!(read_message(&mut observer), b"three");

        let (result, state) = handle.join().unwrap();
        assert!(result.is_ok());
        assert_eq!(state, ReactorState::Terminated);

        unsafe { libc::close(input_fd) };
        server_shutdown.store(true, Ordering::SeqCst);
        server.join().unwrap().unwrap();
    }

    #[test]
    fn test_client_with_empty_input_exits() {
        let (addr, server_shutdown, server) = start_server();
        let input_fd = File::open("/dev/null").unwrap().into_raw_fd();

        let mut client = Client::connect(
            &client_config(addr),
            input_fd,
            SharedOutput::default(),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        assert!(client.run().is_ok());

        unsafe { libc::close(input_fd) };
        server_shutdown.store(true, Ordering::SeqCst);
        server.join().unwrap().unwrap();
    }

    #[test]
    fn test_connect_refused_is_fatal() {
        // Bind then drop to find a port with nothing listening
        let addr = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        let (input_fd, input) = input_pipe();

        let result = Client::connect(
            &client_config(addr),
            input_fd,
            SharedOutput::default(),
            Arc::new(AtomicBool::new(false)),
        );
        assert!(matches!(result, Err(ChatError::Io { op: "connect()", .. })));

        drop(input);
        unsafe { libc::close(input_fd) };
    }
}
