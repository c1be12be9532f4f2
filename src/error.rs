//! Error types for the relay.
//! `TuyaError` covers the wire and device channel, `DispatchError` the command path.

use std::time::Duration;
use thiserror::Error;

/// Errors raised while talking to a Tuya device or decoding its traffic.
#[derive(Error, Debug, Clone)]
pub enum TuyaError {
    /// Standard IO error (network, socket options, etc.)
    #[error("IO error: {0}")]
    Io(String),

    /// JSON serialization or deserialization error
    #[error("JSON error: {0}")]
    Json(String),

    /// Failed to decrypt a message from the device (wrong key or version)
    #[error("Decryption failed")]
    DecryptionFailed,

    /// Failed to encrypt a message for the device
    #[error("Encryption failed")]
    EncryptionFailed,

    /// The payload received from the device was malformed or unexpected
    #[error("Invalid payload")]
    InvalidPayload,

    #[error("Timeout waiting for device")]
    Timeout,

    #[error("CRC mismatch")]
    CrcMismatch,

    /// HMAC signature verification failed (v3.4)
    #[error("HMAC mismatch")]
    HmacMismatch,

    /// TCP connection could not be established
    #[error("Socket connection failed")]
    ConnectionFailed,

    #[error("Invalid header")]
    InvalidHeader,

    #[error("Decode error: {0}")]
    DecodeError(String),

    /// Key negotiation (handshake) failed
    #[error("Handshake failed")]
    HandshakeFailed,

    /// Generic error for wrong Local Key or Protocol Version
    #[error("Check device key or version")]
    KeyOrVersionError,

    /// The device answered with a non-zero return code
    #[error("Device rejected command (retcode {retcode}): {message}")]
    DeviceRejected { retcode: u32, message: String },
}

/// A specialized Result type for Tuya operations.
pub type Result<T> = std::result::Result<T, TuyaError>;

impl From<std::io::Error> for TuyaError {
    fn from(err: std::io::Error) -> Self {
        TuyaError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TuyaError {
    fn from(err: serde_json::Error) -> Self {
        TuyaError::Json(err.to_string())
    }
}

/// Reasons a command request fails before or while reaching the device.
#[derive(Error, Debug, Clone)]
pub enum DispatchError {
    #[error("field tuya_device_id is required")]
    MissingDeviceId,

    #[error("field local_key is required")]
    MissingLocalKey,

    #[error("action must be 'on' or 'off', got '{0}'")]
    InvalidAction(String),

    #[error("lan_ip must be a bare IP (e.g. 192.168.0.50) without http:// or a port, got '{0}'")]
    MalformedIp(String),

    #[error("could not resolve the LAN IP of device {0}")]
    IpNotResolved(String),

    #[error("command failed on every protocol version tried: {0}")]
    DeviceCommandFailed(#[source] TuyaError),

    #[error("request timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
}
