//! Length-prefixed frame codec

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Stream ended in the middle of a frame")]
    IncompleteFrame,
}

/// Frame codec shared by the control plane and the forwarding streams
///
/// Format: `[length: u32 big-endian][payload]`. Structured messages use a
/// JSON payload; UDP datagrams relayed over a tunnel stream use the raw
/// datagram (header included) as payload.
pub struct FrameCodec;

impl FrameCodec {
    /// Maximum frame size (1MB)
    pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

    /// Encode a message to a complete frame
    pub fn encode<T: Serialize>(msg: &T) -> Result<Bytes, CodecError> {
        let payload = serde_json::to_vec(msg)?;
        Self::encode_frame(&payload)
    }

    /// Wrap an opaque payload in a frame
    pub fn encode_frame(payload: &[u8]) -> Result<Bytes, CodecError> {
        if payload.len() > Self::MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(payload);

        Ok(buf.freeze())
    }

    /// Decode a message from an accumulation buffer
    ///
    /// Returns Ok(Some(message)) if a complete frame was decoded,
    /// Ok(None) if more data is needed.
    pub fn decode<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>, CodecError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > Self::MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(length));
        }

        if buf.len() < 4 + length {
            return Ok(None);
        }

        let _ = buf.split_to(4);
        let payload = buf.split_to(length);

        Ok(Some(serde_json::from_slice(&payload)?))
    }

    /// Write one frame carrying `payload` and flush it
    pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), CodecError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let frame = Self::encode_frame(payload)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read exactly one frame
    ///
    /// Never reads past the end of the frame, so the stream can be handed
    /// to a raw byte pump afterwards. Returns `None` if the stream ended
    /// cleanly before a new frame started.
    pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Bytes>, CodecError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut length_bytes = [0u8; 4];
        let first = reader.read(&mut length_bytes[..1]).await?;
        if first == 0 {
            return Ok(None);
        }
        read_exact_or_incomplete(reader, &mut length_bytes[1..]).await?;

        let length = u32::from_be_bytes(length_bytes) as usize;
        if length > Self::MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(length));
        }

        let mut payload = vec![0u8; length];
        read_exact_or_incomplete(reader, &mut payload).await?;

        Ok(Some(Bytes::from(payload)))
    }

    /// Serialize `msg` and write it as one frame
    pub async fn write_message<W, T>(writer: &mut W, msg: &T) -> Result<(), CodecError>
    where
        W: AsyncWrite + Unpin + ?Sized,
        T: Serialize,
    {
        let payload = serde_json::to_vec(msg)?;
        Self::write_frame(writer, &payload).await
    }

    /// Read one frame and deserialize it
    pub async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>, CodecError>
    where
        R: AsyncRead + Unpin + ?Sized,
        T: DeserializeOwned,
    {
        match Self::read_frame(reader).await? {
            Some(payload) => Ok(Some(serde_json::from_slice(&payload)?)),
            None => Ok(None),
        }
    }
}

async fn read_exact_or_incomplete<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(CodecError::IncompleteFrame),
        Err(e) => Err(CodecError::IoError(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ControlMessage;

    #[test]
    fn test_decode_incomplete() {
        let msg = ControlMessage::new("vpn1", 51000);
        let encoded = FrameCodec::encode(&msg).unwrap();

        // Only provide length header
        let mut buf = BytesMut::from(&encoded[..4]);
        let result: Option<ControlMessage> = FrameCodec::decode(&mut buf).unwrap();
        assert_eq!(result, None);

        // Provide rest of frame
        buf.extend_from_slice(&encoded[4..]);
        let result: Option<ControlMessage> = FrameCodec::decode(&mut buf).unwrap();
        assert_eq!(result, Some(msg));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_rejects_oversized_length() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&((FrameCodec::MAX_FRAME_SIZE + 1) as u32).to_be_bytes());
        let result: Result<Option<ControlMessage>, _> = FrameCodec::decode(&mut buf);
        assert!(matches!(result, Err(CodecError::FrameTooLarge(_))));
    }

    #[tokio::test]
    async fn test_read_frame_leaves_trailing_bytes() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        FrameCodec::write_message(&mut client, &ControlMessage::new("a", 0))
            .await
            .unwrap();
        client.write_all(b"raw payload").await.unwrap();
        drop(client);

        let msg: ControlMessage = FrameCodec::read_message(&mut server).await.unwrap().unwrap();
        assert_eq!(msg.tag, "a");

        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"raw payload");
    }

    #[tokio::test]
    async fn test_read_frame_clean_eof() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let frame = FrameCodec::read_frame(&mut server).await.unwrap();
        assert!(frame.is_none());
    }

    #[tokio::test]
    async fn test_read_frame_truncated() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0, 0, 0, 10, 1, 2]).await.unwrap();
        drop(client);

        let result = FrameCodec::read_frame(&mut server).await;
        assert!(matches!(result, Err(CodecError::IncompleteFrame)));
    }
}
