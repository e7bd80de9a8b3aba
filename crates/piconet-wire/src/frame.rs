//! Stream framing for connection-oriented traffic.
//!
//! Each frame is a 4-byte big-endian length header followed by a body whose
//! first byte is the frame tag. A connection starts with `Connect` carrying
//! the requester's handshake and is answered by `Accept` or `Reject`; after
//! that only `Data` frames flow, each carrying one encoded envelope.

use crate::error::WireError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum single frame size (16 MB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Largest frame body after the tag byte.
pub const MAX_DATA_SIZE: usize = MAX_FRAME_SIZE as usize - 1;

const TAG_CONNECT: u8 = 1;
const TAG_ACCEPT: u8 = 2;
const TAG_REJECT: u8 = 3;
const TAG_DATA: u8 = 4;

/// A framed message on an established stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Connection request with the attached handshake payload.
    Connect(Vec<u8>),
    /// The connection request was admitted.
    Accept,
    /// The connection request was refused.
    Reject,
    /// Application data (an encoded envelope).
    Data(Vec<u8>),
}

impl Frame {
    fn tag(&self) -> u8 {
        match self {
            Frame::Connect(_) => TAG_CONNECT,
            Frame::Accept => TAG_ACCEPT,
            Frame::Reject => TAG_REJECT,
            Frame::Data(_) => TAG_DATA,
        }
    }

    fn body(&self) -> &[u8] {
        match self {
            Frame::Connect(body) | Frame::Data(body) => body,
            Frame::Accept | Frame::Reject => &[],
        }
    }
}

/// Encode a frame to bytes (4-byte big-endian length + tag + body).
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, WireError> {
    let body = frame.body();
    check_data_size(body.len())?;
    let len = body.len() + 1;
    let mut bytes = Vec::with_capacity(4 + len);
    bytes.extend_from_slice(&(len as u32).to_be_bytes());
    bytes.push(frame.tag());
    bytes.extend_from_slice(body);
    Ok(bytes)
}

/// Refuse bodies that would not fit in one frame.
pub fn check_data_size(len: usize) -> Result<(), WireError> {
    if len > MAX_DATA_SIZE {
        return Err(WireError::MessageTooLarge {
            size: u32::try_from(len + 1).unwrap_or(u32::MAX),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(())
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Parse a frame body (tag + payload).
pub fn decode_frame(body: &[u8]) -> Result<Frame, WireError> {
    let (tag, rest) = body
        .split_first()
        .ok_or_else(|| WireError::HandshakeFailed("empty frame".to_string()))?;
    match *tag {
        TAG_CONNECT => Ok(Frame::Connect(rest.to_vec())),
        TAG_ACCEPT => Ok(Frame::Accept),
        TAG_REJECT => Ok(Frame::Reject),
        TAG_DATA => Ok(Frame::Data(rest.to_vec())),
        other => Err(WireError::HandshakeFailed(format!(
            "unknown frame tag {other}"
        ))),
    }
}

/// Write a frame to a stream.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_frame(frame)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a frame from a stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = decode_length(&header);
    if len > MAX_FRAME_SIZE {
        return Err(WireError::MessageTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    decode_frame(&body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let frame = Frame::Data(b"payload".to_vec());
        let bytes = encode_frame(&frame).unwrap();
        // First 4 bytes are length
        let len = decode_length(&[bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(len as usize, bytes.len() - 4);
        assert_eq!(decode_frame(&bytes[4..]).unwrap(), frame);
    }

    #[test]
    fn test_data_size_limit() {
        assert!(check_data_size(MAX_DATA_SIZE).is_ok());
        assert!(matches!(
            check_data_size(MAX_DATA_SIZE + 1),
            Err(WireError::MessageTooLarge { max: MAX_FRAME_SIZE, .. })
        ));
        assert!(encode_frame(&Frame::Data(vec![0; MAX_DATA_SIZE + 1])).is_err());
    }

    #[test]
    fn test_control_frames_have_no_body() {
        let bytes = encode_frame(&Frame::Accept).unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 1, TAG_ACCEPT]);
        assert_eq!(decode_frame(&[TAG_REJECT]).unwrap(), Frame::Reject);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        assert!(decode_frame(&[0x7F, 1, 2]).is_err());
        assert!(decode_frame(&[]).is_err());
    }

    #[tokio::test]
    async fn test_stream_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, &Frame::Connect(b"hs".to_vec()))
            .await
            .unwrap();
        write_frame(&mut client, &Frame::Data(Vec::new()))
            .await
            .unwrap();
        drop(client);

        assert_eq!(
            read_frame(&mut server).await.unwrap(),
            Frame::Connect(b"hs".to_vec())
        );
        assert_eq!(read_frame(&mut server).await.unwrap(), Frame::Data(vec![]));
        assert!(matches!(
            read_frame(&mut server).await,
            Err(WireError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_oversized_header_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&(MAX_FRAME_SIZE + 1).to_be_bytes())
            .await
            .unwrap();
        match read_frame(&mut server).await {
            Err(WireError::MessageTooLarge { size, max }) => {
                assert_eq!(size, MAX_FRAME_SIZE + 1);
                assert_eq!(max, MAX_FRAME_SIZE);
            }
            other => panic!("Expected MessageTooLarge, got {other:?}"),
        }
    }
}
