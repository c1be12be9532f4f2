//! UDP-based device discovery.
//! Listens for Tuya broadcast packets and decodes device information.

use crate::crypto::TuyaCipher;
use crate::error::{Result, TuyaError};
use crate::protocol::{self, CommandType, TuyaMessage, Version};
use log::{debug, error, info, warn};
use serde_json::Value;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// DiscoveryResult contains information about a discovered Tuya device.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryResult {
    /// Device ID (gwId)
    pub id: String,
    /// Device IP address
    pub ip: String,
    /// Protocol version hint (e.g., 3.1, 3.3, 3.4)
    pub version: Option<Version>,
    pub product_key: Option<String>,
}

/// Discovery key used by v3.3 and v3.4 broadcasts on port 6667
const UDP_KEY: &[u8] = &[
    0x6c, 0x1e, 0xc8, 0xe2, 0xbb, 0x9b, 0xb5, 0x9a, 0xb5, 0x0b, 0x0d, 0xaf, 0x64, 0x9b, 0x41, 0x0a,
];
/// Alternate key seen on some v3.3 firmware
const UDP_KEY_ALT: &[u8] = b"yG9shRKIBrIBUjc3";
const UDP_KEYS: &[&[u8]] = &[UDP_KEY, UDP_KEY_ALT];

pub const DEFAULT_PORTS: &[u16] = &[6666, 6667];
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const BROADCAST_INTERVAL: Duration = Duration::from_secs(6);
const BROADCAST_COUNT: u32 = 2;

/// A source of discovery sweeps.
pub trait Discovery: Send + Sync + 'static {
    /// Listens for announcements for one bounded window.
    fn scan(&self) -> impl Future<Output = Result<Vec<DiscoveryResult>>> + Send;
}

/// Scanner discovers Tuya devices on the local network using UDP broadcast.
#[derive(Debug, Clone)]
pub struct Scanner {
    /// Length of the listening window
    pub timeout: Duration,
    /// Local address to bind to
    pub bind_addr: String,
    /// UDP ports to listen on (default: 6666, 6667)
    pub ports: Vec<u16>,
}

impl Default for Scanner {
    fn default() -> Self {
        Self::new()
    }
}

impl Scanner {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            bind_addr: "0.0.0.0".to_string(),
            ports: DEFAULT_PORTS.to_vec(),
        }
    }

    /// Set discovery timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set ports to listen on.
    pub fn with_ports(mut self, ports: Vec<u16>) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_bind_addr<S: Into<String>>(mut self, bind_addr: S) -> Self {
        self.bind_addr = bind_addr.into();
        self
    }

    /// Send a discovery request so quiet devices announce themselves.
    async fn send_discovery_broadcast(&self, socket: &UdpSocket, port: u16) -> Result<()> {
        let msg = TuyaMessage {
            seqno: 0,
            cmd: CommandType::UdpNew as u32,
            retcode: None,
            payload: serde_json::to_vec(&serde_json::json!({ "gwId": "", "devId": "" }))?,
        };
        let packed = protocol::pack_message(&msg, None)?;
        let broadcast_addr = SocketAddr::from(([255, 255, 255, 255], port));

        match socket.send_to(&packed, broadcast_addr).await {
            Ok(len) => debug!(
                "Sent discovery broadcast to {}: {} bytes",
                broadcast_addr, len
            ),
            Err(e) => warn!(
                "Failed to send discovery broadcast to {}: {}",
                broadcast_addr, e
            ),
        }
        Ok(())
    }

    /// Create and configure a UDP socket for a given port.
    fn create_socket(&self, port: u16) -> Result<UdpSocket> {
        let addr: SocketAddr = format!("{}:{}", self.bind_addr, port)
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        debug!("Creating UDP socket for port {}...", port);
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;

        if let Err(e) = socket.set_reuse_address(true) {
            warn!("Failed to set reuse_address on port {}: {}", port, e);
        }
        if let Err(e) = socket.set_broadcast(true) {
            warn!("Failed to set broadcast on port {}: {}", port, e);
        }

        if let Err(e) = socket.bind(&SockAddr::from(addr)) {
            error!("Failed to bind to {}: {}", addr, e);
            return Err(e.into());
        }
        socket.set_nonblocking(true)?;

        let std_socket: std::net::UdpSocket = socket.into();
        Ok(UdpSocket::from_std(std_socket)?)
    }

    /// Scans the local network for all Tuya devices.
    ///
    /// Blocks for the whole window and returns one result per announcing IP,
    /// in the order they were first heard.
    pub async fn scan(&self) -> Result<Vec<DiscoveryResult>> {
        info!(
            "Starting Tuya device scan (addr: {}, ports: {:?}, window: {}s)...",
            self.bind_addr,
            self.ports,
            self.timeout.as_secs()
        );

        let mut sockets = Vec::new();
        for &port in &self.ports {
            match self.create_socket(port) {
                Ok(s) => sockets.push((Arc::new(s), port)),
                Err(e) => warn!("Failed to listen on port {}: {}", port, e),
            }
        }
        if sockets.is_empty() {
            return Err(TuyaError::Io("No available ports for scanning".to_string()));
        }

        let (tx, mut rx) = mpsc::channel::<(Vec<u8>, SocketAddr)>(100);
        let cancel_token = CancellationToken::new();

        for (socket, _) in &sockets {
            let tx = tx.clone();
            let socket = socket.clone();
            let ct = cancel_token.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    tokio::select! {
                        _ = ct.cancelled() => break,
                        res = socket.recv_from(&mut buf) => {
                            match res {
                                Ok((len, addr)) => {
                                    if tx.send((buf[..len].to_vec(), addr)).await.is_err() {
                                        break;
                                    }
                                }
                                Err(_) => break,
                            }
                        }
                    }
                }
            });
        }
        drop(tx);

        let deadline = Instant::now() + self.timeout;
        let mut broadcast_interval = tokio::time::interval(BROADCAST_INTERVAL);
        let mut broadcast_count = 0;
        let mut seen_ips = HashSet::new();
        let mut results = Vec::new();

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                _ = broadcast_interval.tick(), if broadcast_count < BROADCAST_COUNT => {
                    for (socket, port) in &sockets {
                        let _ = self.send_discovery_broadcast(socket, *port).await;
                    }
                    broadcast_count += 1;
                }
                packet = rx.recv() => {
                    let Some((data, addr)) = packet else { break };
                    debug!("Received UDP packet from {}: {} bytes", addr, data.len());

                    if let Some(res) = parse_packet(&data)
                        && seen_ips.insert(res.ip.clone())
                    {
                        debug!(
                            "Discovered device: ID={}, IP={}, version={:?}",
                            res.id, res.ip, res.version
                        );
                        results.push(res);
                    }
                }
            }
        }

        cancel_token.cancel();
        info!("Scan finished. Found {} devices.", results.len());
        Ok(results)
    }
}

impl Discovery for Scanner {
    fn scan(&self) -> impl Future<Output = Result<Vec<DiscoveryResult>>> + Send {
        Scanner::scan(self)
    }
}

/// Parse a received UDP packet into a DiscoveryResult.
pub fn parse_packet(data: &[u8]) -> Option<DiscoveryResult> {
    // 1. Raw JSON (v3.1, port 6666)
    if let Ok(val) = serde_json::from_slice::<Value>(data) {
        return parse_json(&val);
    }

    // 2. 55AA frame, plaintext or ECB payload
    for no_retcode in [Some(false), Some(true), None] {
        let msg = match protocol::unpack_message(data, None, None, no_retcode) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("unpack_message failed: {}", e);
                continue;
            }
        };
        if msg.payload.is_empty() {
            continue;
        }

        if let Ok(val) = serde_json::from_slice::<Value>(&msg.payload) {
            return parse_json(&val);
        }

        for key in UDP_KEYS {
            if let Ok(cipher) = TuyaCipher::new(key)
                && let Ok(decrypted) = cipher.decrypt(&msg.payload)
                && let Ok(val) = serde_json::from_slice::<Value>(&decrypted)
            {
                return parse_json(&val);
            }
        }
    }

    // 3. Entire packet as AES-ECB
    for key in UDP_KEYS {
        if let Ok(cipher) = TuyaCipher::new(key)
            && let Ok(decrypted) = cipher.decrypt(data)
            && let Ok(val) = serde_json::from_slice::<Value>(&decrypted)
        {
            return parse_json(&val);
        }
    }

    // 4. JSON embedded somewhere in the packet
    if let Some(pos) = data.iter().position(|&b| b == b'{')
        && let Ok(val) = serde_json::from_slice::<Value>(&data[pos..])
    {
        return parse_json(&val);
    }

    debug!("Failed to parse UDP packet");
    None
}

/// Extract device info from an announcement.
fn parse_json(val: &Value) -> Option<DiscoveryResult> {
    let id = val
        .get("gwId")
        .or_else(|| val.get("devId"))
        .or_else(|| val.get("id"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())?;
    let ip = val
        .get("ip")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())?;

    Some(DiscoveryResult {
        id: id.to_string(),
        ip: ip.to_string(),
        version: val
            .get("version")
            .and_then(|v| v.as_str())
            .and_then(|s| Version::from_str(s).ok()),
        product_key: val
            .get("productKey")
            .and_then(|v| v.as_str())
            .map(str::to_string),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ANNOUNCE: &[u8] =
        br#"{"ip":"192.168.1.40","gwId":"bf11aa","active":2,"encrypt":true,"productKey":"keyabc","version":"3.3"}"#;

    #[test]
    fn plain_json_announcement() {
        let res = parse_packet(ANNOUNCE).unwrap();
        assert_eq!(res.id, "bf11aa");
        assert_eq!(res.ip, "192.168.1.40");
        assert_eq!(res.version, Some(Version::V3_3));
        assert_eq!(res.product_key.as_deref(), Some("keyabc"));
    }

    #[test]
    fn encrypted_6667_announcement() {
        let payload = TuyaCipher::new(UDP_KEY)
            .unwrap()
            .encrypt(ANNOUNCE, true)
            .unwrap();
        let frame = protocol::pack_message(
            &TuyaMessage {
                seqno: 0,
                cmd: CommandType::UdpNew as u32,
                retcode: Some(0),
                payload,
            },
            None,
        )
        .unwrap();

        let res = parse_packet(&frame).unwrap();
        assert_eq!(res.id, "bf11aa");
        assert_eq!(res.ip, "192.168.1.40");
    }

    #[test]
    fn unencrypted_6666_frame() {
        let frame = protocol::pack_message(
            &TuyaMessage {
                seqno: 0,
                cmd: CommandType::Udp as u32,
                retcode: Some(0),
                payload: br#"{"ip":"10.0.0.9","gwId":"bf22","version":"3.1"}"#.to_vec(),
            },
            None,
        )
        .unwrap();

        let res = parse_packet(&frame).unwrap();
        assert_eq!(res.ip, "10.0.0.9");
        assert_eq!(res.version, Some(Version::V3_1));
    }

    #[test]
    fn announcements_need_id_and_ip() {
        assert!(parse_packet(br#"{"gwId":"bf33"}"#).is_none());
        assert!(parse_packet(br#"{"ip":"10.0.0.1","gwId":""}"#).is_none());
        assert!(parse_packet(b"\x01\x02garbage").is_none());
    }

    #[test]
    fn unknown_version_is_only_a_missing_hint() {
        let res = parse_packet(br#"{"ip":"10.0.0.2","devId":"bf44","version":"9.9"}"#).unwrap();
        assert_eq!(res.id, "bf44");
        assert_eq!(res.version, None);
    }

    #[tokio::test]
    async fn scan_without_bindable_port_fails() {
        let scanner = Scanner::new()
            .with_bind_addr("not-an-address")
            .with_timeout(Duration::from_millis(50));
        assert!(Scanner::scan(&scanner).await.is_err());
    }

    #[tokio::test]
    async fn scan_collects_announcements_once_per_ip() {
        let probe = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let scanner = Scanner::new()
            .with_bind_addr("127.0.0.1")
            .with_ports(vec![port])
            .with_timeout(Duration::from_millis(500));
        let scan = tokio::spawn(async move { Scanner::scan(&scanner).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for _ in 0..3 {
            sender.send_to(ANNOUNCE, ("127.0.0.1", port)).await.unwrap();
        }

        let results = scan.await.unwrap().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "bf11aa");
    }
}
