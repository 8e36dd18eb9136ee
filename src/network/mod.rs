//! Network Module
//!
//! TCP plumbing for the master protocol: checksummed frames, an accept
//! loop and a pooled client connection.

mod client;
mod server;

pub use client::ConnectionPool;
pub use server::{NetworkServer, ServerHandle};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Largest frame body accepted from a peer
pub const MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;

/// Frame header for wire protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Body length
    pub length: u32,
    /// Body checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut buf = &bytes[..];
        let length = buf.get_u32_le();
        let checksum = buf.get_u32_le();
        Self { length, checksum }
    }

    fn verify(&self, body: &[u8]) -> Result<()> {
        if crc32fast::hash(body) != self.checksum {
            return Err(Error::Protocol("Frame checksum mismatch".into()));
        }
        Ok(())
    }
}

/// Read one framed body from a reader
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Bytes> {
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length as usize > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "Frame of {} bytes exceeds limit",
            header.length
        )));
    }

    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;
    header.verify(&body)?;

    Ok(Bytes::from(body))
}

/// Write one framed body to a writer
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<()> {
    let header = FrameHeader::new(body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;

    Ok(())
}

/// Check whether an error is a clean end of stream from the peer
pub fn is_eof(error: &Error) -> bool {
    matches!(error, Error::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_header() {
        let data = b"test message data";
        let header = FrameHeader::new(data);
        let bytes = header.to_bytes();
        let restored = FrameHeader::from_bytes(&bytes);

        assert_eq!(header, restored);
        assert_eq!(restored.length, data.len() as u32);
    }

    #[tokio::test]
    async fn test_frame_through_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"hello").await.unwrap();
        let body = read_frame(&mut b).await.unwrap();
        assert_eq!(&body[..], b"hello");
    }

    #[tokio::test]
    async fn test_corrupted_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let header = FrameHeader::new(b"hello");
        a.write_all(&header.to_bytes()).await.unwrap();
        a.write_all(b"hellp").await.unwrap();

        let result = read_frame(&mut b).await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }
}
