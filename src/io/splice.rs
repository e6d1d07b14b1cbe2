//! Bidirectional copy with idle-timeout enforcement
//!
//! This module splices bytes between the two sides of a tunnel. Each
//! direction copies independently; EOF, an I/O error, or an idle read on
//! either side ends both directions, and returning from the splice drops
//! (closes) both sockets.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Read buffer size per direction
///
/// usbmuxd is chatty and interactive ssh moves multi-KiB frames; 4 KiB
/// buffers measurably hurt throughput here.
pub const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Result of a splice operation
#[derive(Debug, Clone, Copy)]
pub struct SpliceResult {
    /// Bytes transferred from the client side to the device side
    pub client_to_device: u64,
    /// Bytes transferred from the device side to the client side
    pub device_to_client: u64,
    /// Whether the splice ended because a read sat idle past the deadline
    pub idle_timed_out: bool,
}

impl SpliceResult {
    /// Total bytes transferred in both directions
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.client_to_device + self.device_to_client
    }
}

/// How one direction of the splice ended
enum DirectionEnd {
    Eof,
    Idle,
}

/// Copy one direction until EOF, error, or an idle read
async fn copy_direction<R, W>(
    reader: &mut R,
    writer: &mut W,
    idle: Duration,
    transferred: &AtomicU64,
) -> io::Result<DirectionEnd>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE].into_boxed_slice();

    loop {
        let n = match timeout(idle, reader.read(&mut buf)).await {
            Err(_) => return Ok(DirectionEnd::Idle),
            Ok(result) => result?,
        };

        if n == 0 {
            writer.flush().await?;
            return Ok(DirectionEnd::Eof);
        }

        writer.write_all(&buf[..n]).await?;
        transferred.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Splice bytes between `client` and `device` until either side ends
///
/// Both streams are consumed; returning from this function closes them.
/// The first direction to hit EOF, an error, or the idle deadline
/// terminates the pair; the other direction's in-flight buffer is not
/// retried.
///
/// # Errors
///
/// Returns the underlying I/O error if either direction fails; EOF and
/// idle timeouts are normal completions.
pub async fn splice_with_idle_timeout<A, B>(
    client: A,
    device: B,
    idle: Duration,
) -> io::Result<SpliceResult>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut device_read, mut device_write) = tokio::io::split(device);

    let client_to_device = AtomicU64::new(0);
    let device_to_client = AtomicU64::new(0);

    let end = tokio::select! {
        end = copy_direction(&mut client_read, &mut device_write, idle, &client_to_device) => end?,
        end = copy_direction(&mut device_read, &mut client_write, idle, &device_to_client) => end?,
    };

    Ok(SpliceResult {
        client_to_device: client_to_device.into_inner(),
        device_to_client: device_to_client.into_inner(),
        idle_timed_out: matches!(end, DirectionEnd::Idle),
    })
}
