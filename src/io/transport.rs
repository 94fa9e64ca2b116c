//! Transport layer - line framing and the client writer
//!
//! Both sides of the bridge speak newline-delimited JSON-RPC. This module
//! only knows about frames (one line plus its terminator); it has no notion
//! of message contents or process lifecycle.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, trace};

// ============================================================================
// Framing
// ============================================================================

/// Outcome of reading one frame from a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A frame of the given byte length (terminator included) was read
    Line(usize),
    /// The stream reached end-of-file
    Eof,
}

/// Split a frame into its body and its line terminator (`\n`, `\r\n` or none)
pub fn split_terminator(line: &[u8]) -> (&[u8], &[u8]) {
    if line.ends_with(b"\r\n") {
        line.split_at(line.len() - 2)
    } else if line.ends_with(b"\n") {
        line.split_at(line.len() - 1)
    } else {
        (line, &[])
    }
}

/// Read one newline-terminated frame into `buf` (cleared first).
///
/// A final unterminated line is returned as a frame without a terminator;
/// the next call then reports EOF.
pub async fn read_line_frame<R>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<ReadOutcome>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    buf.clear();
    match reader.read_until(b'\n', buf).await? {
        0 => Ok(ReadOutcome::Eof),
        n => Ok(ReadOutcome::Line(n)),
    }
}

// ============================================================================
// Client Writer
// ============================================================================

/// Error returned when the client writer task has stopped
#[derive(Debug, thiserror::Error)]
#[error("Client output is closed")]
pub struct WriterClosed;

/// Serializes every write to the client output through a single task.
///
/// The outbound pump and the supervisor (restart notifications) both write
/// to the client; routing them through one channel keeps frames whole.
#[derive(Debug, Clone)]
pub struct ClientWriter {
    sender: mpsc::UnboundedSender<Vec<u8>>,
}

impl ClientWriter {
    /// Spawn the writer task over `output`
    pub fn spawn<W>(output: W) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(Self::writer_task(output, receiver));
        (Self { sender }, task)
    }

    /// Queue one complete frame for the client
    pub fn send(&self, frame: Vec<u8>) -> Result<(), WriterClosed> {
        self.sender.send(frame).map_err(|_| WriterClosed)
    }

    /// Queue a line, appending a `\n` terminator
    pub fn send_line(&self, line: impl Into<String>) -> Result<(), WriterClosed> {
        let mut frame = line.into().into_bytes();
        frame.push(b'\n');
        self.send(frame)
    }

    /// Background task that writes frames to the client with immediate flush
    async fn writer_task<W>(mut output: W, mut receiver: mpsc::UnboundedReceiver<Vec<u8>>)
    where
        W: AsyncWrite + Unpin,
    {
        while let Some(frame) = receiver.recv().await {
            trace!("ClientWriter: writing frame (length: {})", frame.len());

            if let Err(e) = output.write_all(&frame).await {
                error!("Failed to write to client output: {}", e);
                break;
            }

            if let Err(e) = output.flush().await {
                error!("Failed to flush client output: {}", e);
                break;
            }
        }

        // Dropping the receiver makes every later send() fail fast
        receiver.close();
        trace!("ClientWriter: writer task finished");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, BufReader};

    #[test]
    fn test_split_terminator() {
        assert_eq!(split_terminator(b"abc\n"), (&b"abc"[..], &b"\n"[..]));
        assert_eq!(split_terminator(b"abc\r\n"), (&b"abc"[..], &b"\r\n"[..]));
        assert_eq!(split_terminator(b"abc"), (&b"abc"[..], &b""[..]));
        assert_eq!(split_terminator(b"\n"), (&b""[..], &b"\n"[..]));
    }

    #[tokio::test]
    async fn test_read_line_frame_keeps_terminators() {
        let data: &[u8] = b"first\nsecond\r\nlast";
        let mut reader = BufReader::new(data);
        let mut buf = Vec::new();

        assert_eq!(
            read_line_frame(&mut reader, &mut buf).await.unwrap(),
            ReadOutcome::Line(6)
        );
        assert_eq!(buf, b"first\n");

        read_line_frame(&mut reader, &mut buf).await.unwrap();
        assert_eq!(buf, b"second\r\n");

        assert_eq!(
            read_line_frame(&mut reader, &mut buf).await.unwrap(),
            ReadOutcome::Line(4)
        );
        assert_eq!(buf, b"last");

        assert_eq!(
            read_line_frame(&mut reader, &mut buf).await.unwrap(),
            ReadOutcome::Eof
        );
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_client_writer_preserves_order() {
        let (client_side, bridge_side) = tokio::io::duplex(1024);
        let (writer, task) = ClientWriter::spawn(bridge_side);

        writer.send(b"one\n".to_vec()).unwrap();
        writer.send_line("two").unwrap();
        writer.send(b"three\r\n".to_vec()).unwrap();
        drop(writer);
        task.await.unwrap();

        let mut received = String::new();
        let mut client_side = client_side;
        client_side.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "one\ntwo\nthree\r\n");
    }

    #[tokio::test]
    async fn test_client_writer_reports_closed_output() {
        let (client_side, bridge_side) = tokio::io::duplex(64);
        drop(client_side);
        let (writer, task) = ClientWriter::spawn(bridge_side);

        writer.send_line("lost").unwrap();
        task.await.unwrap();

        assert!(writer.send_line("after close").is_err());
    }
}
