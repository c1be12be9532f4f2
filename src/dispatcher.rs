//! Turns a command request into an on/off call against the device, resolving
//! its address and falling back across protocol versions.

use crate::device::{Action, DeviceControl, Target, TuyaLink};
use crate::directory::DeviceDirectory;
use crate::error::{DispatchError, TuyaError};
use crate::protocol::Version;
use crate::scanner::{Discovery, Scanner};
use log::{debug, error, info, warn};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Versions tried in order; the first that succeeds wins.
pub const VERSION_FALLBACK: &[Version] = &[Version::V3_3, Version::V3_4];

const ADDR_AUTO: &str = "auto";

/// One on/off request. Every field may be missing on the wire, and
/// non-string values are kept as their JSON text.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommandRequest {
    #[serde(default, deserialize_with = "lenient_string")]
    pub action: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub tuya_device_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub local_key: Option<String>,
    /// Absent, empty or "auto" asks for discovery
    #[serde(default, deserialize_with = "lenient_string")]
    pub lan_ip: Option<String>,
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    })
}

impl CommandRequest {
    pub fn new(action: &str, device_id: &str, local_key: &str, lan_ip: Option<&str>) -> Self {
        Self {
            action: Some(action.to_string()),
            tuya_device_id: Some(device_id.to_string()),
            local_key: Some(local_key.to_string()),
            lan_ip: lan_ip.map(str::to_string),
        }
    }

    pub fn action(&self) -> &str {
        self.action.as_deref().unwrap_or_default()
    }

    pub fn device_id(&self) -> &str {
        self.tuya_device_id.as_deref().unwrap_or_default()
    }

    pub fn local_key(&self) -> &str {
        self.local_key.as_deref().unwrap_or_default()
    }

    pub fn lan_ip(&self) -> &str {
        self.lan_ip.as_deref().unwrap_or_default()
    }
}

fn wants_discovery(lan_ip: &str) -> bool {
    let lan_ip = lan_ip.trim();
    lan_ip.is_empty() || lan_ip.eq_ignore_ascii_case(ADDR_AUTO)
}

fn sanitize_ip(raw: &str) -> Result<String, DispatchError> {
    let ip = raw.trim();
    if ip.starts_with("http://") || ip.starts_with("https://") {
        return Err(DispatchError::MalformedIp(ip.to_string()));
    }
    Ok(ip.to_string())
}

/// Validates requests and drives them to the device.
pub struct Dispatcher<D = Scanner, C = TuyaLink> {
    directory: DeviceDirectory<D>,
    control: C,
    site_name: String,
}

impl<D: Discovery, C: DeviceControl> Dispatcher<D, C> {
    pub fn new(directory: DeviceDirectory<D>, control: C, site_name: impl Into<String>) -> Self {
        Self {
            directory,
            control,
            site_name: site_name.into(),
        }
    }

    pub fn directory(&self) -> &DeviceDirectory<D> {
        &self.directory
    }

    pub fn site_name(&self) -> &str {
        &self.site_name
    }

    /// Validates `request` and switches the device. Success means no attempt
    /// raised an error; the device's reply is only logged.
    pub async fn dispatch(&self, request: &CommandRequest) -> Result<(), DispatchError> {
        let device_id = request.device_id();
        if device_id.is_empty() {
            return Err(DispatchError::MissingDeviceId);
        }
        let local_key = request.local_key();
        if local_key.is_empty() {
            return Err(DispatchError::MissingLocalKey);
        }
        let action: Action = request
            .action()
            .parse()
            .map_err(DispatchError::InvalidAction)?;

        let lan_ip = if wants_discovery(request.lan_ip()) {
            info!(
                "No lan_ip given (or 'auto'); discovering the IP of device {}...",
                device_id
            );
            self.directory
                .resolve(device_id)
                .await
                .ok_or_else(|| DispatchError::IpNotResolved(device_id.to_string()))?
        } else {
            request.lan_ip().to_string()
        };
        let ip = sanitize_ip(&lan_ip)?;

        info!(
            "[{}] Sending '{}' to {} @ {}",
            self.site_name, action, device_id, ip
        );
        let target = Target {
            id: device_id.to_string(),
            ip,
            local_key: local_key.to_string(),
        };
        self.send(&target, action).await
    }

    async fn send(&self, target: &Target, action: Action) -> Result<(), DispatchError> {
        let mut last_error = None;

        for &version in VERSION_FALLBACK {
            debug!("Trying protocol version {} for {}", version, target.id);
            match self.control.execute(target, version, action).await {
                Ok(reply) => {
                    info!(
                        "Device {} @ {} accepted '{}' on v{}; reply: {:?}",
                        target.id, target.ip, action, version, reply
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "Version {} failed for {} @ {}: {}",
                        version, target.id, target.ip, e
                    );
                    last_error = Some(e);
                }
            }
        }

        let cause = last_error
            .unwrap_or_else(|| TuyaError::Io("no protocol versions configured".to_string()));
        error!(
            "Giving up on '{}' for {} @ {} after versions {:?}: {}",
            action, target.id, target.ip, VERSION_FALLBACK, cause
        );
        Err(DispatchError::DeviceCommandFailed(cause))
    }
}
