//! Length-prefixed framing.
//!
//! ```text
//! [u32 BE: len][signal bytes of len]
//! ```

use crate::config::SvpConfig;
use crate::{Result, SvpError};
use bytes::{Buf, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

/// Read a length-prefixed frame.
///
/// Returns `None` on clean EOF. Once the length prefix has arrived the rest
/// of the frame must follow within `payload_timeout`; a peer that stalls or
/// closes mid-frame is treated like one that disconnected.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    payload_timeout: Duration,
) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > SvpConfig::MAX_FRAME_SIZE {
        return Err(SvpError::FrameTooLarge {
            size: len,
            max: SvpConfig::MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    match tokio::time::timeout(payload_timeout, reader.read_exact(&mut payload)).await {
        Ok(Ok(_)) => Ok(Some(payload)),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            debug!("Peer closed inside a {} byte frame", len);
            Ok(None)
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => {
            debug!("Frame of {} bytes not completed within {:?}", len, payload_timeout);
            Ok(None)
        }
    }
}

/// Split one complete frame off the front of `buf`.
///
/// Returns `None` until the whole frame has been buffered, so a reader that
/// fills `buf` with cancel-safe reads never loses a partly received frame.
pub fn take_frame(buf: &mut BytesMut) -> Result<Option<BytesMut>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > SvpConfig::MAX_FRAME_SIZE {
        return Err(SvpError::FrameTooLarge {
            size: len,
            max: SvpConfig::MAX_FRAME_SIZE,
        });
    }
    if buf.len() < 4 + len {
        buf.reserve(4 + len - buf.len());
        return Ok(None);
    }
    buf.advance(4);
    Ok(Some(buf.split_to(len)))
}

/// Write a length-prefixed frame.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > SvpConfig::MAX_FRAME_SIZE {
        return Err(SvpError::FrameTooLarge {
            size: payload.len(),
            max: SvpConfig::MAX_FRAME_SIZE,
        });
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_frame_read_write_roundtrip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").await.unwrap();
        assert_eq!(&buf[..4], &[0, 0, 0, 5]);

        let mut cursor = std::io::Cursor::new(buf);
        let read_back = read_frame(&mut cursor, WAIT).await.unwrap();
        assert_eq!(read_back, Some(b"hello".to_vec()));
        assert_eq!(read_frame(&mut cursor, WAIT).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_frame_read_empty_stream_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert!(read_frame(&mut cursor, WAIT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_read_short_payload_returns_none() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&10u32.to_be_bytes());
        buf.extend_from_slice(b"abc");
        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_frame(&mut cursor, WAIT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_read_oversized_returns_error() {
        let huge_len = (SvpConfig::MAX_FRAME_SIZE + 1) as u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&huge_len.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor, WAIT).await,
            Err(SvpError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_take_frame_waits_for_whole_frame() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0]);
        assert!(take_frame(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&[0, 3, b'a']);
        assert!(take_frame(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 5);

        buf.extend_from_slice(b"bc\0\0");
        assert_eq!(&take_frame(&mut buf).unwrap().unwrap()[..], b"abc");
        // the start of the next frame stays buffered
        assert_eq!(&buf[..], &[0, 0]);

        let mut huge = BytesMut::new();
        huge.extend_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            take_frame(&mut huge),
            Err(SvpError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_payload_times_out() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&8u32.to_be_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();

        let result = read_frame(&mut server, Duration::from_millis(100)).await.unwrap();
        assert!(result.is_none());
        drop(client);
    }
}
