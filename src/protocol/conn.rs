//! `Conn`: the framed, bidirectional, concurrency-safe message stream
//! (§4.2).
//!
//! `send` and `receive` each serialize behind their own lock, so a slow
//! reader never blocks a concurrent writer and vice versa — the same shape
//! as the teacher's IPC connection, just carrying newline-delimited JSON
//! instead of length-prefixed binary frames.

use crate::protocol::message::{Envelope, Payload};
use crate::types::{Error, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

/// A framed connection over any async byte stream. `R` and `W` are
/// typically split halves of the same stream (a TCP socket, a child
/// process's stdio, or a duplex pair in tests).
pub struct Conn<R, W> {
    reader: Mutex<BufReader<R>>,
    writer: Mutex<W>,
}

impl<R, W> std::fmt::Debug for Conn<R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn").finish_non_exhaustive()
    }
}

impl<R, W> Conn<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: Mutex::new(BufReader::new(reader)),
            writer: Mutex::new(writer),
        }
    }

    /// Serialize and write one envelope, terminated by `\n`. Safe to call
    /// concurrently with itself and with [`Conn::receive`].
    pub async fn send(&self, payload: Payload) -> Result<()> {
        self.send_envelope(Envelope::new(payload)).await
    }

    /// As [`Conn::send`], but lets the caller attach a correlation id.
    pub async fn send_envelope(&self, envelope: Envelope) -> Result<()> {
        let mut line = serde_json::to_string(&envelope)?;
        line.push('\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Block until a full line is read and parsed, or the stream ends or
    /// fails. A closed stream and a malformed line both raise
    /// [`Error::Protocol`]; callers that need to distinguish "peer hung up
    /// cleanly" should check `source` of the I/O error instead.
    pub async fn receive(&self) -> Result<Envelope> {
        let mut reader = self.reader.lock().await;
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            return Err(Error::protocol("connection closed".to_string()));
        }
        let trimmed = line.trim_end_matches(['\n', '\r']);
        serde_json::from_str(trimmed)
            .map_err(|e| Error::protocol(format!("malformed envelope: {e}")))
    }
}
