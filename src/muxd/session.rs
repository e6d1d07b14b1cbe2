//! Mux session: one connection to the usbmuxd UNIX socket
//!
//! A session is used in one of two modes: a single request/reply round
//! trip (Connect), or a long-lived Listen subscription that feeds events
//! to a handler. The socket is owned by the session and closed on every
//! exit path; it is never shared across tasks. After a successful Connect
//! the session converts into the raw stream for byte splicing.

use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{debug, trace};

use super::frame::FrameHeader;
use super::message::{build_listen, parse_reply, MuxEvent, Reply};
use crate::error::{MuxError, ProtocolError};

/// Upper bound on a single payload; usbmuxd frames are small
const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// One connection to usbmuxd
#[derive(Debug)]
pub struct MuxSession {
    stream: UnixStream,
}

impl MuxSession {
    /// Connect to the usbmuxd socket
    ///
    /// # Errors
    ///
    /// Returns `MuxError::Connect` if the socket is unreachable.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, MuxError> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path)
            .await
            .map_err(|e| MuxError::connect(path, e))?;

        trace!("Connected to usbmuxd at {:?}", path);

        Ok(Self { stream })
    }

    /// Send one plist payload framed with a header
    async fn send(&mut self, payload: &[u8]) -> Result<(), MuxError> {
        FrameHeader::plist(payload.len())
            .write_to(&mut self.stream)
            .await?;
        self.stream.write_all(payload).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read and decode one reply
    async fn receive(&mut self) -> Result<Reply, MuxError> {
        let header = FrameHeader::read_from(&mut self.stream).await?;

        let len = header.payload_len();
        if len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::BadLength(header.total_length).into());
        }

        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).await?;

        Ok(parse_reply(&payload)?)
    }

    /// Perform one request/reply round trip
    ///
    /// # Errors
    ///
    /// Returns `MuxError` on transport failure or a malformed reply.
    pub async fn request(&mut self, payload: &[u8]) -> Result<Reply, MuxError> {
        self.send(payload).await?;
        self.receive().await
    }

    /// Subscribe to attach/detach events, invoking `handler` for each
    ///
    /// Sends `Listen`, requires the `Result Success` acknowledgement, then
    /// loops forever. The loop only terminates on socket error or when the
    /// future is dropped (cancellation), which closes the socket.
    ///
    /// # Errors
    ///
    /// Returns `MuxError::SubscriptionRefused` if usbmuxd rejects the
    /// Listen request, otherwise the first transport or protocol failure.
    pub async fn subscribe<F>(mut self, mut handler: F) -> Result<(), MuxError>
    where
        F: FnMut(MuxEvent),
    {
        self.send(&build_listen()?).await?;

        match self.receive().await? {
            Reply::Result(code) if code.is_success() => {
                debug!("Event subscription established");
            }
            Reply::Result(code) => {
                return Err(MuxError::SubscriptionRefused {
                    number: code.as_number(),
                });
            }
            // usbmuxd may flush a queued event ahead of the acknowledgement
            Reply::Event(event) => handler(event),
        }

        loop {
            match self.receive().await? {
                Reply::Event(event) => handler(event),
                Reply::Result(code) => {
                    debug!("Ignoring stray result {} on event subscription", code);
                }
            }
        }
    }

    /// Give up the session and return the raw stream
    ///
    /// Used after a successful `Connect` reply, when the socket stops
    /// speaking the mux protocol and becomes the tunnel byte pipe.
    #[must_use]
    pub fn into_stream(self) -> UnixStream {
        self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::muxd::message::{build_connect, DeviceProperties, ResultCode};
    use plist::{Dictionary, Value};

    fn session_pair() -> (MuxSession, UnixStream) {
        let (client, server) = UnixStream::pair().unwrap();
        (MuxSession { stream: client }, server)
    }

    async fn write_reply(stream: &mut UnixStream, value: &Value) {
        let mut payload = Vec::new();
        value.to_writer_xml(&mut payload).unwrap();
        FrameHeader::plist(payload.len())
            .write_to(stream)
            .await
            .unwrap();
        stream.write_all(&payload).await.unwrap();
    }

    fn result_value(number: u64) -> Value {
        let mut dict = Dictionary::new();
        dict.insert("MessageType".into(), Value::from("Result"));
        dict.insert("Number".into(), Value::from(number));
        Value::Dictionary(dict)
    }

    fn attached_value(device_id: u64, serial: &str) -> Value {
        let mut properties = Dictionary::new();
        properties.insert("SerialNumber".into(), Value::from(serial));
        properties.insert("ConnectionSpeed".into(), Value::from(480_000_000i64));
        properties.insert("ConnectionType".into(), Value::from("USB"));
        properties.insert("ProductID".into(), Value::from(4776u64));
        properties.insert("LocationID".into(), Value::from(1u64));
        properties.insert("DeviceID".into(), Value::from(device_id));

        let mut dict = Dictionary::new();
        dict.insert("MessageType".into(), Value::from("Attached"));
        dict.insert("Properties".into(), Value::Dictionary(properties));
        Value::Dictionary(dict)
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let (mut session, mut server) = session_pair();

        let peer = tokio::spawn(async move {
            let header = FrameHeader::read_from(&mut server).await.unwrap();
            let mut payload = vec![0u8; header.payload_len()];
            server.read_exact(&mut payload).await.unwrap();

            // The request arrives with the swapped port intact
            let value = Value::from_reader(std::io::Cursor::new(payload.as_slice())).unwrap();
            let dict = value.as_dictionary().unwrap();
            assert_eq!(
                dict.get("PortNumber").and_then(Value::as_unsigned_integer),
                Some(0x1600)
            );

            write_reply(&mut server, &result_value(0)).await;
        });

        let payload = build_connect(4, 22).unwrap();
        let reply = session.request(&payload).await.unwrap();
        assert_eq!(reply, Reply::Result(ResultCode::Success));

        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_dispatches_events() {
        let (session, mut server) = session_pair();

        let peer = tokio::spawn(async move {
            // Consume the Listen request
            let header = FrameHeader::read_from(&mut server).await.unwrap();
            let mut payload = vec![0u8; header.payload_len()];
            server.read_exact(&mut payload).await.unwrap();

            write_reply(&mut server, &result_value(0)).await;
            write_reply(&mut server, &attached_value(4, "UDID-A")).await;

            let mut detached = Dictionary::new();
            detached.insert("MessageType".into(), Value::from("Detached"));
            detached.insert("DeviceID".into(), Value::from(4u64));
            write_reply(&mut server, &Value::Dictionary(detached)).await;
            // Dropping the server side ends the subscription
        });

        let mut seen = Vec::new();
        let result = session.subscribe(|event| seen.push(event)).await;

        // EOF after the last event surfaces as a protocol error
        assert!(result.is_err());
        assert_eq!(seen.len(), 2);
        assert!(matches!(
            &seen[0],
            MuxEvent::Attached(DeviceProperties { device_id: 4, .. })
        ));
        assert_eq!(seen[1], MuxEvent::Detached { device_id: 4 });

        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_refused() {
        let (session, mut server) = session_pair();

        let peer = tokio::spawn(async move {
            let header = FrameHeader::read_from(&mut server).await.unwrap();
            let mut payload = vec![0u8; header.payload_len()];
            server.read_exact(&mut payload).await.unwrap();

            write_reply(&mut server, &result_value(5)).await;
        });

        let result = session.subscribe(|_| {}).await;
        assert!(matches!(
            result,
            Err(MuxError::SubscriptionRefused { number: 5 })
        ));

        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_missing_socket() {
        let result = MuxSession::connect("/nonexistent/usbmuxd.sock").await;
        assert!(matches!(result, Err(MuxError::Connect { .. })));
    }
}
