//! usbmuxd frame header encoding and decoding

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 16;

/// Protocol version for plist payloads
pub const PLIST_VERSION: u32 = 1;

/// Request opcode for plist payloads
pub const PLIST_REQUEST: u32 = 8;

/// Tag echoed by usbmuxd in replies; the relay ignores the echo
pub const DEFAULT_TAG: u32 = 1;

/// usbmuxd frame header: four little-endian u32s
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Total frame length, header included
    pub total_length: u32,
    /// Protocol version (1 = plist)
    pub version: u32,
    /// Request opcode (8 = plist payload)
    pub request: u32,
    /// Request tag, echoed in the reply
    pub tag: u32,
}

impl FrameHeader {
    /// Create a plist frame header for a payload of `payload_len` bytes
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn plist(payload_len: usize) -> Self {
        Self {
            total_length: (HEADER_SIZE + payload_len) as u32,
            version: PLIST_VERSION,
            request: PLIST_REQUEST,
            tag: DEFAULT_TAG,
        }
    }

    /// Payload length declared by this header
    #[must_use]
    pub const fn payload_len(&self) -> usize {
        (self.total_length as usize) - HEADER_SIZE
    }

    /// Read a header from the stream
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::TruncatedHeader` if fewer than 16 bytes can
    /// be read and `ProtocolError::BadLength` if `total_length < 16`.
    pub async fn read_from<R>(stream: &mut R) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; HEADER_SIZE];
        stream.read_exact(&mut buf).await.map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                ProtocolError::TruncatedHeader
            } else {
                ProtocolError::Io(e)
            }
        })?;

        let header = Self {
            total_length: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            version: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            request: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            tag: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
        };

        if (header.total_length as usize) < HEADER_SIZE {
            return Err(ProtocolError::BadLength(header.total_length));
        }

        Ok(header)
    }

    /// Write the header to the stream
    ///
    /// The 16 bytes are written with a single `write_all`: either all of
    /// them reach the stream or the call fails.
    pub async fn write_to<W>(&self, stream: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.total_length.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.request.to_le_bytes());
        buf[12..16].copy_from_slice(&self.tag.to_le_bytes());
        stream.write_all(&buf).await
    }
}
