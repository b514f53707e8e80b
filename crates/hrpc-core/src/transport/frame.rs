//! Wire framing.
//!
//! Every message on a connection is one frame: a 4-byte big-endian length
//! covering the rest of the frame, the 8-byte big-endian request id, then the
//! serialized envelope.
//!
//! ```text
//! [u32 BE: len][u64 BE: request id][payload of len - 8 bytes]
//! ```
//!
//! The id sits outside the payload so a reader can pair a response with its
//! pending call even when the payload itself fails to decode.

use crate::config::TransportLimits;
use crate::error::{Result, RpcError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const REQUEST_ID_LEN: usize = 8;

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub request_id: u64,
    pub payload: Bytes,
}

/// Read one frame.
///
/// Returns `Ok(None)` on a clean EOF before the length prefix.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Frame>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len < REQUEST_ID_LEN {
        return Err(RpcError::Protocol {
            message: format!("frame length {} is shorter than the request id", len),
        });
    }
    if len > TransportLimits::MAX_FRAME_SIZE {
        return Err(RpcError::Protocol {
            message: format!(
                "frame size {} exceeds maximum {}",
                len,
                TransportLimits::MAX_FRAME_SIZE
            ),
        });
    }

    let mut body = BytesMut::zeroed(len);
    reader.read_exact(&mut body).await?;

    let request_id = body.get_u64();
    Ok(Some(Frame {
        request_id,
        payload: body.freeze(),
    }))
}

/// Encode one frame into a contiguous buffer.
pub fn encode_frame(request_id: u64, payload: &[u8]) -> Result<Bytes> {
    let len = REQUEST_ID_LEN + payload.len();
    if len > TransportLimits::MAX_FRAME_SIZE {
        return Err(RpcError::Protocol {
            message: format!(
                "frame size {} exceeds maximum {}",
                len,
                TransportLimits::MAX_FRAME_SIZE
            ),
        });
    }

    let mut buf = BytesMut::with_capacity(TransportLimits::FRAME_HEADER_LEN + payload.len());
    buf.put_u32(len as u32);
    buf.put_u64(request_id);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Write one frame and flush it.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    request_id: u64,
    payload: &[u8],
) -> Result<()> {
    let frame = encode_frame(request_id, payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_read_write_roundtrip() {
        let payload = b"hello world";
        let mut buf = Vec::new();

        write_frame(&mut buf, 42, payload).await.unwrap();
        assert_eq!(buf.len(), TransportLimits::FRAME_HEADER_LEN + payload.len());

        let mut cursor = std::io::Cursor::new(buf);
        let frame = read_frame(&mut cursor).await.unwrap().unwrap();

        assert_eq!(frame.request_id, 42);
        assert_eq!(&frame.payload[..], payload);
    }

    #[tokio::test]
    async fn test_frames_are_delimited_on_one_stream() {
        let mut buf = Vec::new();
        write_frame(&mut buf, 1, b"first").await.unwrap();
        write_frame(&mut buf, 2, b"").await.unwrap();
        write_frame(&mut buf, 3, b"third").await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let ids: Vec<u64> = [
            read_frame(&mut cursor).await.unwrap().unwrap(),
            read_frame(&mut cursor).await.unwrap().unwrap(),
            read_frame(&mut cursor).await.unwrap().unwrap(),
        ]
        .iter()
        .map(|frame| frame.request_id)
        .collect();

        assert_eq!(ids, vec![1, 2, 3]);
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_read_empty_stream_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let result = read_frame(&mut cursor).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_frame_read_oversized_returns_error() {
        // Header claims a body larger than the limit
        let huge_len: u32 = (TransportLimits::MAX_FRAME_SIZE + 1) as u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&huge_len.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let mut cursor = std::io::Cursor::new(buf);
        let result = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(RpcError::Protocol { .. })));
    }

    #[tokio::test]
    async fn test_frame_without_request_id_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&4u32.to_be_bytes());
        buf.extend_from_slice(&[0u8; 4]);

        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(RpcError::Protocol { .. })
        ));
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let payload = vec![0u8; TransportLimits::MAX_FRAME_SIZE];
        assert!(matches!(
            encode_frame(1, &payload),
            Err(RpcError::Protocol { .. })
        ));

        let frame = encode_frame(9, b"ok").unwrap();
        assert_eq!(frame.len(), TransportLimits::FRAME_HEADER_LEN + 2);
        assert_eq!(&frame[4..12], &9u64.to_be_bytes());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_io_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, 7, b"payload").await.unwrap();
        buf.truncate(buf.len() - 3);

        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(RpcError::Io { .. })
        ));
    }
}
