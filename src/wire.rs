//! Wire protocol framing (§6)
//!
//! Every message is `{ kind: u32, pathLen: u32, totalLen: u64, pathBytes,
//! payload }`, little-endian. `totalLen` covers the payload only (not the
//! header); `OPEN_FILE_REPLY` signals failure with `totalLen == u64::MAX`
//! and no payload.

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub const HEADER_LEN: usize = 4 + 4 + 8;
const FAILURE_TOTAL_LEN: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageKind {
    OpenFile = 1,
    OpenFileReply = 2,
    RequestBlock = 3,
    SendBlock = 4,
    CloseFile = 5,
}

impl MessageKind {
    fn from_u32(v: u32) -> Result<Self> {
        match v {
            1 => Ok(Self::OpenFile),
            2 => Ok(Self::OpenFileReply),
            3 => Ok(Self::RequestBlock),
            4 => Ok(Self::SendBlock),
            5 => Ok(Self::CloseFile),
            other => Err(Error::UnexpectedMessageKind(other)),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Message {
    OpenFile { path: String },
    OpenFileReply { path: String, size: Option<u64> },
    RequestBlock { path: String, blk: u64, want_compressed: bool },
    SendBlock { path: String, blk: u64, compression: i32, data: Bytes },
    CloseFile { path: String },
}

impl Message {
    fn kind(&self) -> MessageKind {
        match self {
            Message::OpenFile { .. } => MessageKind::OpenFile,
            Message::OpenFileReply { .. } => MessageKind::OpenFileReply,
            Message::RequestBlock { .. } => MessageKind::RequestBlock,
            Message::SendBlock { .. } => MessageKind::SendBlock,
            Message::CloseFile { .. } => MessageKind::CloseFile,
        }
    }

    fn path(&self) -> &str {
        match self {
            Message::OpenFile { path }
            | Message::OpenFileReply { path, .. }
            | Message::RequestBlock { path, .. }
            | Message::SendBlock { path, .. }
            | Message::CloseFile { path } => path,
        }
    }

    fn payload(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Message::OpenFile { .. } | Message::CloseFile { .. } => {}
            Message::OpenFileReply { size, .. } => {
                if let Some(size) = size {
                    buf.put_u64_le(*size);
                }
            }
            Message::RequestBlock { blk, want_compressed, .. } => {
                buf.put_u64_le(*blk);
                buf.put_u8(*want_compressed as u8);
            }
            Message::SendBlock { blk, compression, data, .. } => {
                buf.put_u64_le(*blk);
                buf.put_i32_le(*compression);
                buf.put_u64_le(data.len() as u64);
                buf.put_slice(data);
            }
        }
        buf.freeze()
    }

    /// Write this message to `writer` as one frame.
    pub async fn write_to<W: tokio::io::AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let path_bytes = self.path().as_bytes();
        let payload = self.payload();

        let total_len = if matches!(self, Message::OpenFileReply { size: None, .. }) {
            FAILURE_TOTAL_LEN
        } else {
            payload.len() as u64
        };

        let mut header = BytesMut::with_capacity(HEADER_LEN);
        header.put_u32_le(self.kind() as u32);
        header.put_u32_le(path_bytes.len() as u32);
        header.put_u64_le(total_len);

        writer.write_all(&header).await?;
        writer.write_all(path_bytes).await?;
        if total_len != FAILURE_TOTAL_LEN {
            writer.write_all(&payload).await?;
        }
        writer.flush().await?;
        Ok(())
    }

    /// Read one frame from `reader`.
    pub async fn read_from<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header).await?;
        let mut cursor = &header[..];
        let kind = MessageKind::from_u32(cursor.get_u32_le())?;
        let path_len = cursor.get_u32_le() as usize;
        let total_len = cursor.get_u64_le();

        let mut path_bytes = vec![0u8; path_len];
        reader.read_exact(&mut path_bytes).await?;
        let path = String::from_utf8(path_bytes)
            .map_err(|e| Error::MalformedFrame(format!("path is not utf8: {e}")))?;

        if kind == MessageKind::OpenFileReply && total_len == FAILURE_TOTAL_LEN {
            return Ok(Message::OpenFileReply { path, size: None });
        }

        let mut payload = vec![0u8; total_len as usize];
        reader.read_exact(&mut payload).await?;
        let mut cursor = &payload[..];

        match kind {
            MessageKind::OpenFile => Ok(Message::OpenFile { path }),
            MessageKind::CloseFile => Ok(Message::CloseFile { path }),
            MessageKind::OpenFileReply => {
                if cursor.remaining() < 8 {
                    return Err(Error::MalformedFrame("OPEN_FILE_REPLY missing size".into()));
                }
                Ok(Message::OpenFileReply {
                    path,
                    size: Some(cursor.get_u64_le()),
                })
            }
            MessageKind::RequestBlock => {
                if cursor.remaining() < 9 {
                    return Err(Error::MalformedFrame("REQUEST_BLK_MSG truncated".into()));
                }
                let blk = cursor.get_u64_le();
                let want_compressed = cursor.get_u8() != 0;
                Ok(Message::RequestBlock { path, blk, want_compressed })
            }
            MessageKind::SendBlock => {
                if cursor.remaining() < 20 {
                    return Err(Error::MalformedFrame("SEND_BLK_MSG truncated".into()));
                }
                let blk = cursor.get_u64_le();
                let compression = cursor.get_i32_le();
                let data_size = cursor.get_u64_le() as usize;
                if cursor.remaining() < data_size {
                    return Err(Error::MalformedFrame("SEND_BLK_MSG payload shorter than dataSize".into()));
                }
                let data = Bytes::copy_from_slice(&cursor[..data_size]);
                Ok(Message::SendBlock { path, blk, compression, data })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_roundtrip_request_block() {
        let msg = Message::RequestBlock {
            path: "/data/run1.bin".into(),
            blk: 42,
            want_compressed: true,
        };
        let mut buf = Vec::new();
        msg.write_to(&mut buf).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let decoded = Message::read_from(&mut cursor).await.unwrap();
        match decoded {
            Message::RequestBlock { path, blk, want_compressed } => {
                assert_eq!(path, "/data/run1.bin");
                assert_eq!(blk, 42);
                assert!(want_compressed);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[tokio::test]
    async fn test_open_file_reply_failure_has_no_payload() {
        let msg = Message::OpenFileReply { path: "/missing".into(), size: None };
        let mut buf = Vec::new();
        msg.write_to(&mut buf).await.unwrap();
        assert_eq!(buf.len(), HEADER_LEN + "/missing".len());

        let mut cursor = std::io::Cursor::new(buf);
        let decoded = Message::read_from(&mut cursor).await.unwrap();
        match decoded {
            Message::OpenFileReply { size, .. } => assert!(size.is_none()),
            _ => panic!("wrong variant"),
        }
    }

    #[tokio::test]
    async fn test_roundtrip_send_block() {
        let msg = Message::SendBlock {
            path: "/data/x".into(),
            blk: 7,
            compression: -3,
            data: Bytes::from_static(b"compressed-bytes"),
        };
        let mut buf = Vec::new();
        msg.write_to(&mut buf).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        match Message::read_from(&mut cursor).await.unwrap() {
            Message::SendBlock { blk, compression, data, .. } => {
                assert_eq!(blk, 7);
                assert_eq!(compression, -3);
                assert_eq!(data.as_ref(), b"compressed-bytes");
            }
            _ => panic!("wrong variant"),
        }
    }
}
