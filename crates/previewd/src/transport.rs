use crate::{PreviewError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

/// Upper bound for a single frame record; anything larger means the
/// connection is corrupt.
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Bounded frame buffer between the socket reader and the stream.
const FRAME_CHANNEL_CAP: usize = 16;

/// Input forwarded to the simulator through the companion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InputEvent {
    Touch { phase: TouchPhase, x: f64, y: f64 },
    Text { string: String },
    Button { name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TouchPhase {
    Down,
    Move,
    Up,
}

/// Client side of the companion's frame/input connection.
///
/// Frames arrive as 4-byte big-endian length-prefixed records and are
/// surfaced through a bounded channel that closes when the companion goes
/// away. Input events are JSON lines on the same socket.
pub struct Transport {
    frames: Option<mpsc::Receiver<Vec<u8>>>,
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
}

impl Transport {
    pub async fn connect(port: u16) -> Result<Transport> {
        let stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .map_err(|e| PreviewError::TransportClosed(format!("connect: {}", e)))?;
        let (read_half, write_half) = stream.into_split();
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAP);
        tokio::spawn(read_frames(read_half, frame_tx));
        Ok(Transport {
            frames: Some(frame_rx),
            writer: Arc::new(Mutex::new(Some(write_half))),
        })
    }

    /// The frame stream. Finite: the channel closes when the companion
    /// exits or the socket drops. Can be taken once.
    pub fn frames(&mut self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.frames.take()
    }

    pub async fn send_input(&self, event: &InputEvent) -> Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| PreviewError::TransportClosed("transport closed".into()))?;
        writer
            .write_all(&line)
            .await
            .map_err(|e| PreviewError::TransportClosed(format!("send_input: {}", e)))
    }

    /// Idempotent; drops the write half so the companion sees EOF.
    pub async fn close(&self) {
        let mut guard = self.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            let _ = writer.shutdown().await;
        }
    }
}

async fn read_frames(mut reader: OwnedReadHalf, frames: mpsc::Sender<Vec<u8>>) {
    loop {
        let len = match reader.read_u32().await {
            Ok(len) if len > 0 && len <= MAX_FRAME_LEN => len,
            Ok(0) => continue,
            // Oversize length or EOF: the connection is done either way.
            _ => return,
        };
        let mut frame = vec![0u8; len as usize];
        if reader.read_exact(&mut frame).await.is_err() {
            return;
        }
        // Receiver gone means the stream is tearing down.
        if frames.send(frame).await.is_err() {
            return;
        }
    }
}
