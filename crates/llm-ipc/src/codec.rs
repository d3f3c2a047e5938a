//! Length-prefixed JSON framing for the private endpoint: a little-endian
//! `u32` length followed by the serialized message.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The largest frame either side will accept. Chunks are small; anything
/// bigger than this is a corrupted stream.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Writes one frame.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds the {MAX_FRAME_LEN}-byte limit", body.len()),
        ));
    }
    writer.write_all(&(body.len() as u32).to_le_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await
}

/// Reads one frame. Returns `None` on a clean end-of-stream (the peer went
/// away between frames).
pub async fn read_frame<R, T>(reader: &mut R) -> std::io::Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds the {MAX_FRAME_LEN}-byte limit"),
        ));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ServerMessage, SessionReply};

    #[tokio::test]
    async fn frames_roundtrip_over_a_duplex_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let message = ServerMessage::Reply {
            id: 7,
            reply: SessionReply::Terminated,
        };
        write_frame(&mut a, &message).await.unwrap();
        let read: ServerMessage = read_frame(&mut b).await.unwrap().unwrap();
        assert!(matches!(
            read,
            ServerMessage::Reply {
                id: 7,
                reply: SessionReply::Terminated
            }
        ));
    }

    #[tokio::test]
    async fn clean_eof_reads_as_none() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        let read: Option<ServerMessage> = read_frame(&mut b).await.unwrap();
        assert!(read.is_none());
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            a.write_all(&(u32::MAX).to_le_bytes()).await.ok();
        });
        let read: std::io::Result<Option<ServerMessage>> = read_frame(&mut b).await;
        assert!(read.is_err());
    }
}
