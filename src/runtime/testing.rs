//! In-memory stand-ins for non-blocking sockets.

use std::collections::VecDeque;
use std::io::{self, Read, Write};

/// One scripted read result.
#[derive(Debug)]
pub enum Step {
    Data(Vec<u8>),
    Eof,
    Error(io::ErrorKind),
}

/// Stream that replays scripted reads and records writes.
///
/// Once the read script runs out, reads return `WouldBlock`. Writes follow
/// `write_limits`: `Some(n)` accepts at most `n` bytes, `None` would block.
/// With no limits left, writes accept everything. A stream built with
/// `with_write_error` fails every write instead.
#[derive(Debug, Default)]
pub struct ScriptedStream {
    reads: VecDeque<Step>,
    write_limits: VecDeque<Option<usize>>,
    write_error: Option<io::ErrorKind>,
    written: Vec<u8>,
}

impl ScriptedStream {
    pub fn new(reads: Vec<Step>) -> Self {
        Self {
            reads: reads.into(),
            ..Default::default()
        }
    }

    pub fn with_write_limits(mut self, limits: Vec<Option<usize>>) -> Self {
        self.write_limits = limits.into();
        self
    }

    pub fn with_write_error(mut self, kind: io::ErrorKind) -> Self {
        self.write_error = Some(kind);
        self
    }

    pub fn push(&mut self, step: Step) {
        self.reads.push_back(step);
    }

    pub fn written(&self) -> &[u8] {
        &self.written
    }
}

impl Read for ScriptedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.reads.pop_front() {
            None => Err(io::ErrorKind::WouldBlock.into()),
            Some(Step::Eof) => Ok(0),
            Some(Step::Error(kind)) => Err(kind.into()),
            Some(Step::Data(mut data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    self.reads.push_front(Step::Data(data.split_off(n)));
                }
                Ok(n)
            }
        }
    }
}

impl Write for ScriptedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(kind) = self.write_error {
            return Err(kind.into());
        }
        let n = match self.write_limits.pop_front() {
            None => buf.len(),
            Some(None) => return Err(io::ErrorKind::WouldBlock.into()),
            Some(Some(limit)) => limit.min(buf.len()),
        };
        self.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
