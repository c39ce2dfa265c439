//! Downstream byte sinks
//!
//! Video chunks are handed to a [`StreamSink`] from the media read task, so
//! sinks must not block. The provided sinks forward events over an unbounded
//! channel to a writer task that owns the actual output.

use crate::media::TerminationReason;
use crate::session::{SessionId, StreamSession};
use bytes::Bytes;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Receives the downstream byte stream, one chunk per video packet
pub trait StreamSink: Send + 'static {
    fn session_started(&mut self, _session: &StreamSession) -> io::Result<()> {
        Ok(())
    }

    /// Called synchronously for each video payload, in reception order.
    /// An error means downstream is gone and streaming stops.
    fn write_chunk(&mut self, session: &StreamSession, chunk: Bytes) -> io::Result<()>;

    fn session_ended(
        &mut self,
        _session: &StreamSession,
        _reason: &TerminationReason,
    ) -> io::Result<()> {
        Ok(())
    }
}

/// Sink events as seen by a writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    SessionStarted {
        session_id: SessionId,
        attempt_number: u64,
    },
    Chunk {
        session_id: SessionId,
        data: Bytes,
    },
    SessionEnded {
        session_id: SessionId,
        bytes_emitted: u64,
        reason: String,
    },
}

/// Sink forwarding every event over an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: SinkEvent) -> io::Result<()> {
        self.tx
            .send(event)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "sink receiver dropped"))
    }
}

impl StreamSink for ChannelSink {
    fn session_started(&mut self, session: &StreamSession) -> io::Result<()> {
        self.send(SinkEvent::SessionStarted {
            session_id: session.session_id,
            attempt_number: session.attempt_number,
        })
    }

    fn write_chunk(&mut self, session: &StreamSession, chunk: Bytes) -> io::Result<()> {
        self.send(SinkEvent::Chunk {
            session_id: session.session_id,
            data: chunk,
        })
    }

    fn session_ended(
        &mut self,
        session: &StreamSession,
        reason: &TerminationReason,
    ) -> io::Result<()> {
        self.send(SinkEvent::SessionEnded {
            session_id: session.session_id,
            bytes_emitted: session.bytes_emitted,
            reason: reason.to_string(),
        })
    }
}

/// Write every chunk to `writer` as one continuous stream
///
/// Session boundaries are invisible in the output. Each chunk is flushed as
/// soon as it is written so a downstream player sees it immediately. The
/// task resolves to the number of bytes written once the sender side is
/// dropped.
pub fn spawn_pipe_writer<W>(
    mut rx: mpsc::UnboundedReceiver<SinkEvent>,
    mut writer: W,
) -> JoinHandle<io::Result<u64>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut written = 0u64;

        while let Some(event) = rx.recv().await {
            if let SinkEvent::Chunk { data, .. } = event {
                writer.write_all(&data).await?;
                writer.flush().await?;
                written += data.len() as u64;
            }
        }

        writer.flush().await?;
        Ok(written)
    })
}

/// Write each session to its own file, `seg_{session_id}.{extension}` in `dir`
///
/// The task resolves to the list of files created.
pub fn spawn_segment_writer(
    mut rx: mpsc::UnboundedReceiver<SinkEvent>,
    dir: impl Into<PathBuf>,
    extension: impl Into<String>,
) -> JoinHandle<io::Result<Vec<PathBuf>>> {
    let dir = dir.into();
    let extension = extension.into();

    tokio::spawn(async move {
        tokio::fs::create_dir_all(&dir).await?;

        let mut segments = Vec::new();
        let mut current: Option<(SessionId, BufWriter<File>)> = None;

        while let Some(event) = rx.recv().await {
            match event {
                SinkEvent::SessionStarted { session_id, .. } => {
                    close_segment(current.take()).await?;
                    let path = segment_path(&dir, session_id, &extension);
                    current = Some((session_id, open_segment(&path).await?));
                    segments.push(path);
                }
                SinkEvent::Chunk { session_id, data } => {
                    if current.as_ref().map(|(id, _)| *id) != Some(session_id) {
                        close_segment(current.take()).await?;
                        let path = segment_path(&dir, session_id, &extension);
                        current = Some((session_id, open_segment(&path).await?));
                        segments.push(path);
                    }
                    if let Some((_, file)) = current.as_mut() {
                        file.write_all(&data).await?;
                    }
                }
                SinkEvent::SessionEnded {
                    session_id,
                    bytes_emitted,
                    ..
                } => {
                    if current.as_ref().map(|(id, _)| *id) == Some(session_id) {
                        close_segment(current.take()).await?;
                        info!("Segment {} closed ({} bytes)", session_id, bytes_emitted);
                    }
                }
            }
        }

        close_segment(current.take()).await?;
        Ok(segments)
    })
}

fn segment_path(dir: &Path, session_id: SessionId, extension: &str) -> PathBuf {
    dir.join(format!("seg_{}.{}", session_id, extension))
}

async fn open_segment(path: &Path) -> io::Result<BufWriter<File>> {
    debug!("Opening segment {}", path.display());
    Ok(BufWriter::new(File::create(path).await?))
}

async fn close_segment(segment: Option<(SessionId, BufWriter<File>)>) -> io::Result<()> {
    if let Some((_, mut file)) = segment {
        file.flush().await?;
        file.into_inner().sync_all().await?;
    }
    Ok(())
}
