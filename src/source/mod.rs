pub mod event;
pub mod parse;
pub mod unpack;

use std::fs::File;
use std::io::{self, BufReader, ErrorKind, Read};
use std::net::TcpStream;
use std::path::Path;

use anyhow::{Context, Result};
use thiserror::Error;

use self::event::RawEvent;
use self::parse::{check_body_len, parse_frame, ParseError, LENGTH_PREFIX_SIZE};

/// Errors surfaced by an event source. All of them end ingestion.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("event stream closed")]
    Closed,

    #[error("reading event stream: {0}")]
    Io(#[from] io::Error),

    #[error("decoding frame: {0}")]
    Parse(#[from] ParseError),
}

/// Supplies raw trigger events, one at a time, blocking until one is ready.
pub trait EventSource: Send {
    /// Returns the source's name for logging.
    fn name(&self) -> &str;

    /// Fetches the next event.
    fn next_event(&mut self) -> Result<RawEvent, SourceError>;
}

/// Length-prefixed frame reader over any byte stream.
pub struct FrameSource<R> {
    name: String,
    reader: BufReader<R>,
    body: Vec<u8>,
    frames: u64,
}

impl<R: Read + Send> FrameSource<R> {
    pub fn new(name: impl Into<String>, reader: R) -> Self {
        Self {
            name: name.into(),
            reader: BufReader::new(reader),
            body: Vec::new(),
            frames: 0,
        }
    }

    /// Number of frames decoded so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl FrameSource<TcpStream> {
    /// Connects to an acquisition server streaming frames.
    pub fn connect(addr: &str) -> Result<Self> {
        let stream =
            TcpStream::connect(addr).with_context(|| format!("connecting to server {addr}"))?;
        stream
            .set_nodelay(true)
            .context("setting TCP_NODELAY on event stream")?;

        tracing::info!(addr, "connected to event server");

        Ok(Self::new(format!("tcp:{addr}"), stream))
    }
}

impl FrameSource<File> {
    /// Opens a recorded frame stream for replay.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("opening replay file {}", path.display()))?;

        tracing::info!(path = %path.display(), "replaying event file");

        Ok(Self::new(format!("file:{}", path.display()), file))
    }
}

impl<R: Read + Send> EventSource for FrameSource<R> {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_event(&mut self) -> Result<RawEvent, SourceError> {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        match self.reader.read_exact(&mut prefix) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Err(SourceError::Closed),
            Err(e) => return Err(e.into()),
        }

        let size = check_body_len(u32::from_le_bytes(prefix))?;
        self.body.resize(size, 0);
        self.reader.read_exact(&mut self.body)?;

        let event = parse_frame(&self.body)?;
        self.frames += 1;

        Ok(event)
    }
}
