//! A framed connection to the broker, shared by the request stub and the
//! event listener.
//!
//! Reads go through a buffer that survives cancellation: a caller that
//! gives up waiting leaves any partly received frame in place for the next
//! read. Replies owed to abandoned requests are counted and skipped, so each
//! request is still paired with its own reply.

use crate::config::{AccessConfig, Endpoint};
use crate::wire::{take_frame, write_frame, Signal};
use crate::{Result, SvpError};
use bytes::BytesMut;
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::debug;

const READ_BUFFER: usize = 8 * 1024;

pub(crate) struct Channel {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    peer: String,
    buffer: BytesMut,
    /// Requests sent whose reply has not been read yet.
    unanswered: usize,
    /// Set while a frame is being written; still set if that write was
    /// abandoned halfway, after which the stream cannot be trusted.
    writing: bool,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("peer", &self.peer)
            .field("unanswered", &self.unanswered)
            .finish()
    }
}

impl Channel {
    /// Connect within [`AccessConfig::CONNECT_TIMEOUT`].
    pub(crate) async fn open(endpoint: &Endpoint) -> Result<Self> {
        let peer = endpoint.to_string();
        let lost = || SvpError::ConnectionLost { peer: peer.clone() };

        let channel = match endpoint {
            Endpoint::Tcp { host, port } => {
                let stream = tokio::time::timeout(
                    AccessConfig::CONNECT_TIMEOUT,
                    TcpStream::connect((host.as_str(), *port)),
                )
                .await
                .map_err(|_| lost())??;
                stream.set_nodelay(true)?;
                let (reader, writer) = stream.into_split();
                Channel::from_parts(reader, writer, peer.clone())
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let stream =
                    tokio::time::timeout(AccessConfig::CONNECT_TIMEOUT, UnixStream::connect(path))
                        .await
                        .map_err(|_| lost())??;
                let (reader, writer) = stream.into_split();
                Channel::from_parts(reader, writer, peer.clone())
            }
        };
        debug!("Connected to SVP broker at {}", peer);
        Ok(channel)
    }

    pub(crate) fn from_parts(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        peer: impl Into<String>,
    ) -> Self {
        Channel {
            reader: Box::new(reader),
            writer: Box::new(writer),
            peer: peer.into(),
            buffer: BytesMut::with_capacity(READ_BUFFER),
            unanswered: 0,
            writing: false,
        }
    }

    pub(crate) fn peer(&self) -> &str {
        &self.peer
    }

    fn lost(&self) -> SvpError {
        SvpError::ConnectionLost {
            peer: self.peer.clone(),
        }
    }

    pub(crate) async fn send(&mut self, signal: &Signal) -> Result<()> {
        if self.writing {
            debug!("Earlier write to {} was cut short", self.peer);
            return Err(self.lost());
        }
        let bytes = signal.encode()?;
        self.writing = true;
        let written = write_frame(&mut self.writer, &bytes).await;
        self.writing = false;
        written.map_err(|e| match e {
            SvpError::Io { .. } => self.lost(),
            other => other,
        })
    }

    /// Send a request whose reply will be read with [`Channel::recv_reply`].
    pub(crate) async fn send_request(&mut self, signal: &Signal) -> Result<()> {
        self.send(signal).await?;
        self.unanswered += 1;
        Ok(())
    }

    /// Wait for the reply to the most recent request, skipping replies that
    /// belong to requests whose callers stopped waiting. Cancel safe.
    pub(crate) async fn recv_reply(&mut self) -> Result<Option<Signal>> {
        loop {
            let Some(frame) = self.next_frame().await? else {
                return Ok(None);
            };
            let decoded = Signal::decode(&frame);
            if matches!(&decoded, Ok(signal) if signal.kind().is_push()) {
                continue;
            }
            self.unanswered = self.unanswered.saturating_sub(1);
            if self.unanswered == 0 {
                return decoded.map(Some);
            }
            debug!(
                "Discarding a late reply from {} ({} more owed)",
                self.peer, self.unanswered
            );
        }
    }

    /// Wait for the next signal; `None` once the broker hung up. Cancel safe.
    pub(crate) async fn recv(&mut self) -> Result<Option<Signal>> {
        match self.next_frame().await? {
            Some(frame) => Ok(Some(Signal::decode(&frame)?)),
            None => Ok(None),
        }
    }

    async fn next_frame(&mut self) -> Result<Option<BytesMut>> {
        loop {
            if let Some(frame) = take_frame(&mut self.buffer)? {
                return Ok(Some(frame));
            }
            let read = self
                .reader
                .read_buf(&mut self.buffer)
                .await
                .map_err(|_| self.lost())?;
            if read == 0 {
                if !self.buffer.is_empty() {
                    debug!(
                        "{} closed inside a frame ({} bytes buffered)",
                        self.peer,
                        self.buffer.len()
                    );
                }
                return Ok(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_read_keeps_partial_frame() {
        let (client, mut server) = tokio::io::duplex(256);
        let (reader, writer) = tokio::io::split(client);
        let mut channel = Channel::from_parts(reader, writer, "duplex");

        let bytes = Signal::YesNo { yes: true }.encode().unwrap();
        let mut frame = (bytes.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(&bytes);
        server.write_all(&frame[..3]).await.unwrap();

        let waited = tokio::time::timeout(Duration::from_millis(50), channel.recv()).await;
        assert!(waited.is_err());

        server.write_all(&frame[3..]).await.unwrap();
        assert_eq!(
            channel.recv().await.unwrap(),
            Some(Signal::YesNo { yes: true })
        );
    }

    #[tokio::test]
    async fn test_late_reply_is_skipped() {
        let (client, mut server) = tokio::io::duplex(256);
        let (reader, writer) = tokio::io::split(client);
        let mut channel = Channel::from_parts(reader, writer, "duplex");

        channel
            .send_request(&Signal::IsRegistered {
                identity: crate::ProcessorIdentity::top_level(1001),
            })
            .await
            .unwrap();
        channel
            .send_request(&Signal::PrintDatabase { format: 0 })
            .await
            .unwrap();

        for reply in [
            Signal::YesNo { yes: false },
            Signal::DatabasePrinted {
                text: "empty".to_string(),
            },
        ] {
            crate::wire::write_frame(&mut server, &reply.encode().unwrap())
                .await
                .unwrap();
        }

        assert_eq!(
            channel.recv_reply().await.unwrap(),
            Some(Signal::DatabasePrinted {
                text: "empty".to_string()
            })
        );
    }
}
