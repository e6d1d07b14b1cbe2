//! usbmuxd payload encoding and reply parsing
//!
//! Outgoing payloads are property-list dictionaries serialized as XML;
//! incoming payloads are dictionaries whose `MessageType` selects the
//! variant. The `PortNumber` field of a Connect request carries the 16-bit
//! device port byte-swapped into network order; usbmuxd expects the swap
//! even though the dictionary field is an ordinary integer.

use std::io::Cursor;

use plist::{Dictionary, Value};
use serde::Serialize;

use crate::error::ProtocolError;

/// `ProgName` sent in every request
pub const PROG_NAME: &str = env!("CARGO_PKG_NAME");

/// `ClientVersionString` sent in every request
pub const CLIENT_VERSION: &str = concat!(env!("CARGO_PKG_NAME"), "-", env!("CARGO_PKG_VERSION"));

/// Swap a 16-bit port into network byte order
///
/// usbmuxd reads `PortNumber` as a big-endian 16-bit value stored in a
/// plist integer, so the swap must happen before serialization.
#[must_use]
pub const fn swap_port(port: u16) -> u16 {
    ((port & 0xFF) << 8) | ((port >> 8) & 0xFF)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ListenRequest<'a> {
    message_type: &'a str,
    client_version_string: &'a str,
    prog_name: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ConnectRequest<'a> {
    message_type: &'a str,
    client_version_string: &'a str,
    prog_name: &'a str,
    #[serde(rename = "DeviceID")]
    device_id: u64,
    port_number: u16,
}

/// Build a `Listen` payload as XML-plist bytes
///
/// # Errors
///
/// Returns `ProtocolError::Plist` if serialization fails.
pub fn build_listen() -> Result<Vec<u8>, ProtocolError> {
    let request = ListenRequest {
        message_type: "Listen",
        client_version_string: CLIENT_VERSION,
        prog_name: PROG_NAME,
    };
    let mut payload = Vec::new();
    plist::to_writer_xml(&mut payload, &request)?;
    Ok(payload)
}

/// Build a `Connect` payload as XML-plist bytes
///
/// The `device_port` is byte-swapped here; callers pass the port as it
/// appears in the mapping.
///
/// # Errors
///
/// Returns `ProtocolError::Plist` if serialization fails.
pub fn build_connect(device_id: u64, device_port: u16) -> Result<Vec<u8>, ProtocolError> {
    let request = ConnectRequest {
        message_type: "Connect",
        client_version_string: CLIENT_VERSION,
        prog_name: PROG_NAME,
        device_id,
        port_number: swap_port(device_port),
    };
    let mut payload = Vec::new();
    plist::to_writer_xml(&mut payload, &request)?;
    Ok(payload)
}

/// Result codes usbmuxd returns for Listen and Connect requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    /// Request succeeded
    Success,
    /// The requested device is not attached
    DeviceRequestedNotConnected,
    /// The requested device port is not available
    PortRequestedNotAvailable,
    /// usbmuxd could not parse the request
    MalformedRequest,
}

impl ResultCode {
    /// Decode a result number
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::UnknownResultNumber` for numbers outside the
    /// closed set {0, 2, 3, 5}.
    pub const fn from_number(number: u64) -> Result<Self, ProtocolError> {
        match number {
            0 => Ok(Self::Success),
            2 => Ok(Self::DeviceRequestedNotConnected),
            3 => Ok(Self::PortRequestedNotAvailable),
            5 => Ok(Self::MalformedRequest),
            other => Err(ProtocolError::UnknownResultNumber(other)),
        }
    }

    /// The wire number for this code
    #[must_use]
    pub const fn as_number(self) -> u64 {
        match self {
            Self::Success => 0,
            Self::DeviceRequestedNotConnected => 2,
            Self::PortRequestedNotAvailable => 3,
            Self::MalformedRequest => 5,
        }
    }

    /// Check if this is the success code
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "Success"),
            Self::DeviceRequestedNotConnected => write!(f, "Device requested not connected"),
            Self::PortRequestedNotAvailable => write!(f, "Port requested not available"),
            Self::MalformedRequest => write!(f, "Malformed request"),
        }
    }
}

/// Device record carried by an `Attached` event
///
/// All six fields are required; usbmuxd always sends them for USB devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProperties {
    /// Device UDID
    pub serial_number: String,
    /// Link speed in bits per second
    pub connection_speed: i64,
    /// Transport, e.g. "USB"
    pub connection_type: String,
    /// USB product id
    pub product_id: u64,
    /// USB location id
    pub location_id: u64,
    /// usbmuxd-assigned device id; opaque and unstable across re-attaches
    pub device_id: u64,
}

impl DeviceProperties {
    fn from_dict(dict: &Dictionary) -> Result<Self, ProtocolError> {
        Ok(Self {
            serial_number: required_string(dict, "SerialNumber")?,
            connection_speed: required_signed(dict, "ConnectionSpeed")?,
            connection_type: required_string(dict, "ConnectionType")?,
            product_id: required_unsigned(dict, "ProductID")?,
            location_id: required_unsigned(dict, "LocationID")?,
            device_id: required_unsigned(dict, "DeviceID")?,
        })
    }
}

/// Attach/detach event observed on a Listen subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxEvent {
    /// A device appeared
    Attached(DeviceProperties),
    /// A device disappeared
    Detached {
        /// The id previously announced in an `Attached` event
        device_id: u64,
    },
}

/// One decoded usbmuxd reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Result of a request
    Result(ResultCode),
    /// Attach/detach notification
    Event(MuxEvent),
}

/// Parse a reply payload
///
/// # Errors
///
/// Returns `ProtocolError::UnknownReply` for a `MessageType` outside
/// {Result, Attached, Detached}, `ProtocolError::UnknownResultNumber` for
/// a result number outside {0, 2, 3, 5}, and `ProtocolError::MissingField`
/// when a required field is absent.
pub fn parse_reply(payload: &[u8]) -> Result<Reply, ProtocolError> {
    let value = Value::from_reader(Cursor::new(payload))?;
    let dict = value
        .as_dictionary()
        .ok_or(ProtocolError::MissingField("MessageType"))?;

    let message_type = required_string(dict, "MessageType")?;
    match message_type.as_str() {
        "Result" => {
            let number = required_unsigned(dict, "Number")?;
            Ok(Reply::Result(ResultCode::from_number(number)?))
        }
        "Attached" => {
            let properties = dict
                .get("Properties")
                .and_then(Value::as_dictionary)
                .ok_or(ProtocolError::MissingField("Properties"))?;
            Ok(Reply::Event(MuxEvent::Attached(DeviceProperties::from_dict(
                properties,
            )?)))
        }
        "Detached" => {
            let device_id = required_unsigned(dict, "DeviceID")?;
            Ok(Reply::Event(MuxEvent::Detached { device_id }))
        }
        other => Err(ProtocolError::UnknownReply(other.to_string())),
    }
}

fn required_string(dict: &Dictionary, key: &'static str) -> Result<String, ProtocolError> {
    dict.get(key)
        .and_then(Value::as_string)
        .map(str::to_string)
        .ok_or(ProtocolError::MissingField(key))
}

fn required_unsigned(dict: &Dictionary, key: &'static str) -> Result<u64, ProtocolError> {
    dict.get(key)
        .and_then(Value::as_unsigned_integer)
        .ok_or(ProtocolError::MissingField(key))
}

fn required_signed(dict: &Dictionary, key: &'static str) -> Result<i64, ProtocolError> {
    dict.get(key)
        .and_then(Value::as_signed_integer)
        .ok_or(ProtocolError::MissingField(key))
}
