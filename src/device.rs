//! One-shot communication with a single Tuya device.
//! Each command opens a TCP connection, negotiates a session key on v3.4,
//! sends the request and reads a single reply.

use crate::crypto::TuyaCipher;
use crate::error::{Result, TuyaError};
use crate::protocol::{
    CommandType, HEADER_LEN, TuyaMessage, Version, pack_message, parse_header, unpack_message,
};
use hmac::{Hmac, Mac};
use log::{debug, info};
use rand::RngCore;
use serde_json::Value;
use sha2::Sha256;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

pub const DEFAULT_PORT: u16 = 6668;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Data point of the main relay on Tuya outlets.
const SWITCH_DP: u32 = 1;

/// Version string plus 12 reserved bytes
const VERSION_HEADER_LEN: usize = 15;

const NO_PROTOCOL_HEADER_CMDS: &[u32] = &[
    CommandType::DpQuery as u32,
    CommandType::DpQueryNew as u32,
    CommandType::UpdateDps as u32,
    CommandType::HeartBeat as u32,
    CommandType::SessKeyNegStart as u32,
    CommandType::SessKeyNegResp as u32,
    CommandType::SessKeyNegFinish as u32,
];

const KEY_DPS: &str = "dps";
const KEY_T: &str = "t";
const KEY_DATA: &str = "data";
const KEY_PROTOCOL: &str = "protocol";
const KEY_GW_ID: &str = "gwId";
const KEY_DEV_ID: &str = "devId";
const KEY_UID: &str = "uid";

type HmacSha256 = Hmac<Sha256>;

/// What to do with an outlet's relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    On,
    Off,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::On => "on",
            Action::Off => "off",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "on" => Ok(Action::On),
            "off" => Ok(Action::Off),
            other => Err(other.to_string()),
        }
    }
}

/// Represents a Tuya device reachable at a known address.
#[derive(Debug, Clone)]
pub struct Device {
    id: String,
    address: String,
    local_key: Vec<u8>,
    version: Version,
    port: u16,
    timeout: Duration,
}

impl Device {
    /// Initialize device with ID, address, local key, and protocol version.
    pub fn new<I, A, K>(id: I, address: A, local_key: K, version: Version) -> Self
    where
        I: Into<String>,
        A: Into<String>,
        K: Into<Vec<u8>>,
    {
        Self {
            id: id.into(),
            address: address.into(),
            local_key: local_key.into(),
            version,
            port: DEFAULT_PORT,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Timeout applied separately to connecting, each write and each read.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub async fn turn_on(&self) -> Result<Option<Value>> {
        self.set_value(SWITCH_DP, Value::Bool(true)).await
    }

    pub async fn turn_off(&self) -> Result<Option<Value>> {
        self.set_value(SWITCH_DP, Value::Bool(false)).await
    }

    pub async fn perform(&self, action: Action) -> Result<Option<Value>> {
        match action {
            Action::On => self.turn_on().await,
            Action::Off => self.turn_off().await,
        }
    }

    /// Sets a single Data Point (DP) value on the device.
    pub async fn set_value(&self, index: u32, value: Value) -> Result<Option<Value>> {
        self.set_dps(serde_json::json!({ index.to_string(): value }))
            .await
    }

    /// Sets Data Points on the device and returns its decoded reply, if it sent one.
    pub async fn set_dps(&self, dps: Value) -> Result<Option<Value>> {
        let mut session = self.connect().await?;

        let (cmd, payload) = self.generate_payload(dps);
        session.send_json(cmd, &payload).await?;

        let reply = session.receive().await?;
        let raw = reply.payload;

        if let Some(retcode) = reply.retcode.filter(|&rc| rc != 0) {
            let text = match session.decode_payload(raw.clone()) {
                Ok(plain) => String::from_utf8_lossy(&plain).into_owned(),
                Err(_) => String::from_utf8_lossy(&raw).into_owned(),
            };
            return Err(TuyaError::DeviceRejected {
                retcode,
                message: text,
            });
        }

        let plain = session.decode_payload(raw)?;
        if plain.is_empty() {
            debug!("Device {} acknowledged with an empty reply", self.id);
            return Ok(None);
        }

        serde_json::from_slice(&plain)
            .map(Some)
            .map_err(|_| TuyaError::InvalidPayload)
    }

    fn generate_payload(&self, dps: Value) -> (u32, Value) {
        let t = timestamp();
        if self.version.val() >= 3.4 {
            let payload = serde_json::json!({
                KEY_PROTOCOL: 5,
                KEY_T: t,
                KEY_DATA: { KEY_DPS: dps },
            });
            (CommandType::ControlNew as u32, payload)
        } else {
            let payload = serde_json::json!({
                KEY_GW_ID: self.id,
                KEY_DEV_ID: self.id,
                KEY_UID: self.id,
                KEY_T: t.to_string(),
                KEY_DPS: dps,
            });
            (CommandType::Control as u32, payload)
        }
    }

    fn socket_addr(&self) -> String {
        match self.address.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, self.port).to_string(),
            Err(_) => format!("{}:{}", self.address, self.port),
        }
    }

    async fn connect(&self) -> Result<Session<'_>> {
        let addr = self.socket_addr();
        info!(
            "Connecting to device {} at {} (v{})",
            self.id, addr, self.version
        );

        let stream = timeout(self.timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| TuyaError::Timeout)?
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::ConnectionRefused => TuyaError::ConnectionFailed,
                _ => TuyaError::Io(e.to_string()),
            })?;

        let mut session = Session {
            device: self,
            stream,
            seqno: 1,
            received: 0,
            key: self.local_key.clone(),
        };
        if self.version.val() >= 3.4 {
            session.negotiate_session_key().await?;
        }
        Ok(session)
    }
}

fn timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn strip_version_header(payload: &mut Vec<u8>, version: Version) {
    if payload.len() >= VERSION_HEADER_LEN && payload.starts_with(version.as_bytes()) {
        payload.drain(..VERSION_HEADER_LEN);
    }
}

/// An open connection to a device.
struct Session<'a> {
    device: &'a Device,
    stream: TcpStream,
    seqno: u32,
    received: u32,
    /// Local key, replaced by the negotiated session key on v3.4
    key: Vec<u8>,
}

impl Session<'_> {
    fn is_v34(&self) -> bool {
        self.device.version.val() >= 3.4
    }

    fn hmac_key(&self) -> Option<&[u8]> {
        self.is_v34().then_some(self.key.as_slice())
    }

    fn add_protocol_header(&self, payload: &[u8]) -> Vec<u8> {
        let mut header = self.device.version.as_bytes().to_vec();
        header.extend_from_slice(&[0u8; VERSION_HEADER_LEN - 3]);
        header.extend_from_slice(payload);
        header
    }

    fn pack(&mut self, cmd: u32, payload: Vec<u8>) -> Result<Vec<u8>> {
        let cipher = TuyaCipher::new(&self.key)?;
        let use_header = !NO_PROTOCOL_HEADER_CMDS.contains(&cmd);

        let payload = if self.is_v34() {
            let payload = if use_header {
                self.add_protocol_header(&payload)
            } else {
                payload
            };
            cipher.encrypt(&payload, true)?
        } else {
            let encrypted = cipher.encrypt(&payload, true)?;
            if use_header {
                self.add_protocol_header(&encrypted)
            } else {
                encrypted
            }
        };

        let msg = TuyaMessage {
            seqno: self.seqno,
            cmd,
            retcode: None,
            payload,
        };
        self.seqno += 1;
        debug!(
            "Sending cmd=0x{:02X} seqno={} to {}",
            msg.cmd, msg.seqno, self.device.id
        );
        pack_message(&msg, self.hmac_key())
    }

    async fn send(&mut self, cmd: u32, payload: Vec<u8>) -> Result<()> {
        let packed = self.pack(cmd, payload)?;
        timeout(self.device.timeout, self.stream.write_all(&packed))
            .await
            .map_err(|_| TuyaError::Timeout)??;
        Ok(())
    }

    async fn send_json(&mut self, cmd: u32, payload: &Value) -> Result<()> {
        self.send(cmd, serde_json::to_vec(payload)?).await
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let first_frame = self.received == 0;
        timeout(self.device.timeout, self.stream.read_exact(buf))
            .await
            .map_err(|_| TuyaError::Timeout)?
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    if first_frame {
                        // Dropped before any reply, likely wrong key/version
                        TuyaError::KeyOrVersionError
                    } else {
                        TuyaError::Io("Connection reset by peer".to_string())
                    }
                } else {
                    TuyaError::from(e)
                }
            })?;
        Ok(())
    }

    /// Reads one frame and verifies its trailer. The payload is still encrypted.
    async fn receive(&mut self) -> Result<TuyaMessage> {
        let mut packet = vec![0u8; HEADER_LEN];
        self.read_exact(&mut packet).await?;
        let header = parse_header(&packet)?;

        packet.resize(header.total_length, 0);
        self.read_exact(&mut packet[HEADER_LEN..]).await?;
        self.received += 1;
        debug!(
            "Received frame from {} (hex): {}",
            self.device.id,
            hex::encode(&packet)
        );

        let hmac_key = self.hmac_key();
        unpack_message(&packet, hmac_key, Some(header), Some(false)).map_err(|e| match e {
            TuyaError::HmacMismatch | TuyaError::CrcMismatch => TuyaError::KeyOrVersionError,
            other => other,
        })
    }

    fn decode_payload(&self, mut payload: Vec<u8>) -> Result<Vec<u8>> {
        if payload.is_empty() {
            return Ok(payload);
        }
        let version = self.device.version;
        let cipher = TuyaCipher::new(&self.key)?;

        if !self.is_v34() {
            strip_version_header(&mut payload, version);
            if payload.first() == Some(&b'{') {
                return Ok(payload);
            }
        }
        let mut plain = cipher
            .decrypt(&payload)
            .map_err(|_| TuyaError::KeyOrVersionError)?;
        strip_version_header(&mut plain, version);
        Ok(plain)
    }

    fn hmac(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(&self.device.local_key)
            .map_err(|_| TuyaError::EncryptionFailed)?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    async fn negotiate_session_key(&mut self) -> Result<()> {
        debug!("Starting session key negotiation with {}", self.device.id);

        let mut local_nonce = [0u8; 16];
        rand::rng().fill_bytes(&mut local_nonce);
        self.send(CommandType::SessKeyNegStart as u32, local_nonce.to_vec())
            .await?;

        let resp = self.receive().await?;
        if resp.cmd != CommandType::SessKeyNegResp as u32 {
            return Err(TuyaError::HandshakeFailed);
        }
        let payload = self.decode_payload(resp.payload)?;
        if payload.len() < 48 {
            return Err(TuyaError::KeyOrVersionError);
        }
        let (remote_nonce, remote_hmac) = (&payload[..16], &payload[16..48]);

        if self.hmac(&local_nonce)? != remote_hmac {
            return Err(TuyaError::KeyOrVersionError);
        }

        let proof = self.hmac(remote_nonce)?;
        self.send(CommandType::SessKeyNegFinish as u32, proof).await?;

        let mixed: Vec<u8> = local_nonce
            .iter()
            .zip(remote_nonce)
            .map(|(a, b)| a ^ b)
            .collect();
        self.key = TuyaCipher::new(&self.device.local_key)?.encrypt(&mixed, false)?;
        debug!("Session key negotiated with {}", self.device.id);
        Ok(())
    }
}

/// Identity and address of a device for a single command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub id: String,
    pub ip: String,
    pub local_key: String,
}

/// Sends a switch action to a device speaking a given protocol version.
pub trait DeviceControl: Send + Sync + 'static {
    fn execute(
        &self,
        target: &Target,
        version: Version,
        action: Action,
    ) -> impl Future<Output = Result<Option<Value>>> + Send;
}

/// Talks to real devices over TCP.
#[derive(Debug, Clone)]
pub struct TuyaLink {
    pub port: u16,
    pub timeout: Duration,
}

impl Default for TuyaLink {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl DeviceControl for TuyaLink {
    async fn execute(
        &self,
        target: &Target,
        version: Version,
        action: Action,
    ) -> Result<Option<Value>> {
        Device::new(
            target.id.as_str(),
            target.ip.as_str(),
            target.local_key.as_bytes(),
            version,
        )
        .with_port(self.port)
        .with_timeout(self.timeout)
        .perform(action)
        .await
    }
}
