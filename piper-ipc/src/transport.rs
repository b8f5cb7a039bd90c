//! Line transports over named FIFOs and in-memory channels

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::pipe;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, trace};

use crate::error::IpcError;

/// Reader/writer FIFO paths, named from the side that reads `input`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipePair {
    pub input: PathBuf,
    pub output: PathBuf,
}

impl PipePair {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
        }
    }

    /// The same pair seen from the other end
    pub fn reversed(&self) -> Self {
        Self {
            input: self.output.clone(),
            output: self.input.clone(),
        }
    }

    /// Create both FIFOs if they are missing
    pub fn create(&self) -> Result<(), IpcError> {
        create_fifo(&self.input)?;
        create_fifo(&self.output)
    }
}

/// Create a FIFO readable and writable by the owner; existing ones are kept
pub fn create_fifo(path: &Path) -> Result<(), IpcError> {
    use nix::sys::stat::Mode;

    match nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR) {
        Ok(()) | Err(nix::errno::Errno::EEXIST) => Ok(()),
        Err(errno) => Err(IpcError::IoError(format!(
            "mkfifo {}: {}",
            path.display(),
            errno
        ))),
    }
}

/// Newline framed transport
#[async_trait]
pub trait LineTransport: Send {
    /// Next line, without its terminator
    ///
    /// Implementations must be cancel safe: a read dropped inside a
    /// `select!` loses no data.
    async fn read_line(&mut self) -> Result<String, IpcError>;

    /// Write one line; the terminator is appended here
    async fn write_line(&mut self, line: &str) -> Result<(), IpcError>;
}

/// Default pause before reopening a FIFO that has no peer yet
pub const DEFAULT_REOPEN_DELAY: Duration = Duration::from_millis(50);

/// Persistent endpoint on a pair of named FIFOs
///
/// Both ends are opened lazily and kept open for the life of the endpoint,
/// so a writer that comes and goes does not end the stream.
pub struct FifoPipe {
    pair: PipePair,
    reader: Option<FramedRead<pipe::Receiver, LinesCodec>>,
    writer: Option<pipe::Sender>,
    #[cfg_attr(target_os = "linux", allow(dead_code))]
    reopen_delay: Duration,
}

impl FifoPipe {
    pub fn new(pair: PipePair) -> Self {
        Self::with_reopen_delay(pair, DEFAULT_REOPEN_DELAY)
    }

    pub fn with_reopen_delay(pair: PipePair, reopen_delay: Duration) -> Self {
        Self {
            pair,
            reader: None,
            writer: None,
            reopen_delay,
        }
    }

    pub fn pair(&self) -> &PipePair {
        &self.pair
    }

    fn open_receiver(path: &Path) -> Result<pipe::Receiver, IpcError> {
        let mut options = pipe::OpenOptions::new();
        // Holding a write handle on our own input keeps EOF away when the
        // remote writer closes.
        #[cfg(target_os = "linux")]
        options.read_write(true);
        options
            .open_receiver(path)
            .map_err(|e| IpcError::IoError(format!("open {}: {}", path.display(), e)))
    }

    #[cfg_attr(target_os = "linux", allow(unused_variables))]
    async fn open_sender(path: &Path, reopen_delay: Duration) -> Result<pipe::Sender, IpcError> {
        let mut options = pipe::OpenOptions::new();
        #[cfg(target_os = "linux")]
        options.read_write(true);
        loop {
            match options.open_sender(path) {
                Ok(sender) => return Ok(sender),
                #[cfg(not(target_os = "linux"))]
                Err(e) if e.raw_os_error() == Some(nix::libc::ENXIO) => {
                    // No reader yet
                    tokio::time::sleep(reopen_delay).await;
                }
                Err(e) => {
                    return Err(IpcError::IoError(format!(
                        "open {}: {}",
                        path.display(),
                        e
                    )))
                }
            }
        }
    }

    fn reader(&mut self) -> Result<&mut FramedRead<pipe::Receiver, LinesCodec>, IpcError> {
        if self.reader.is_none() {
            debug!("Opening input pipe {}", self.pair.input.display());
            let receiver = Self::open_receiver(&self.pair.input)?;
            self.reader = Some(FramedRead::new(receiver, LinesCodec::new()));
        }
        self.reader.as_mut().ok_or(IpcError::NotConfigured("input"))
    }

    async fn writer(&mut self) -> Result<&mut pipe::Sender, IpcError> {
        if self.writer.is_none() {
            debug!("Opening output pipe {}", self.pair.output.display());
            self.writer = Some(Self::open_sender(&self.pair.output, self.reopen_delay).await?);
        }
        self.writer.as_mut().ok_or(IpcError::NotConfigured("output"))
    }
}

fn codec_error(err: LinesCodecError) -> IpcError {
    match err {
        LinesCodecError::Io(e) => IpcError::from(e),
        other => IpcError::IoError(other.to_string()),
    }
}

#[async_trait]
impl LineTransport for FifoPipe {
    async fn read_line(&mut self) -> Result<String, IpcError> {
        loop {
            let next = self.reader()?.next().await;
            match next {
                Some(Ok(line)) => {
                    trace!("Received line on {}: {}", self.pair.input.display(), line);
                    return Ok(line);
                }
                Some(Err(e)) => return Err(codec_error(e)),
                None => {
                    #[cfg(target_os = "linux")]
                    return Err(IpcError::ConnectionClosed);

                    // Every writer closed; reopen and wait for the next one
                    #[cfg(not(target_os = "linux"))]
                    {
                        self.reader = None;
                        tokio::time::sleep(self.reopen_delay).await;
                    }
                }
            }
        }
    }

    async fn write_line(&mut self, line: &str) -> Result<(), IpcError> {
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');
        let writer = self.writer().await?;
        writer.write_all(buf.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Channel backed transport for tests and in-process wiring
pub struct MemoryTransport {
    rx: mpsc::UnboundedReceiver<String>,
    tx: mpsc::UnboundedSender<String>,
}

impl MemoryTransport {
    /// Two connected endpoints
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self { rx: a_rx, tx: b_tx },
            Self { rx: b_rx, tx: a_tx },
        )
    }
}

#[async_trait]
impl LineTransport for MemoryTransport {
    async fn read_line(&mut self) -> Result<String, IpcError> {
        self.rx.recv().await.ok_or(IpcError::ConnectionClosed)
    }

    async fn write_line(&mut self, line: &str) -> Result<(), IpcError> {
        self.tx
            .send(line.to_string())
            .map_err(|_| IpcError::ConnectionClosed)
    }
}
