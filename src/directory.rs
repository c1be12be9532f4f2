//! Device identifier to LAN IP lookups, backed by discovery scans and a
//! process-lifetime cache.

use crate::error::TuyaError;
use crate::scanner::{Discovery, DiscoveryResult, Scanner};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use thiserror::Error;

/// Failures inside the directory. Callers of [`DeviceDirectory::resolve`] only
/// ever see `None`.
#[derive(Error, Debug, Clone)]
pub enum DirectoryError {
    #[error("discovery scan failed: {0}")]
    ScanFailed(#[source] TuyaError),

    #[error("device {0} did not answer the scan")]
    NotFound(String),
}

/// Answers "what is the LAN IP of device X?".
///
/// Entries are never evicted: once a device is cached it is never scanned
/// for again, even if it later moves to another address.
pub struct DeviceDirectory<D = Scanner> {
    discovery: D,
    cache: Mutex<HashMap<String, String>>,
    // Serializes every scan. Held across awaits, so it is the tokio mutex.
    scan_gate: tokio::sync::Mutex<()>,
}

impl<D: Discovery> DeviceDirectory<D> {
    pub fn new(discovery: D) -> Self {
        Self {
            discovery,
            cache: Mutex::new(HashMap::new()),
            scan_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Cached IP for `device_id`, without touching the network.
    pub fn cached(&self, device_id: &str) -> Option<String> {
        self.cache.lock().get(device_id).cloned()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }

    async fn try_scan(&self) -> Result<Vec<DiscoveryResult>, DirectoryError> {
        self.discovery
            .scan()
            .await
            .map_err(DirectoryError::ScanFailed)
    }

    /// Runs one discovery sweep. Transport failures are logged and yield an
    /// empty set. Waits for any lookup scan already in progress.
    pub async fn scan_all(&self) -> Vec<DiscoveryResult> {
        let _gate = self.scan_gate.lock().await;
        match self.try_scan().await {
            Ok(devices) => devices,
            Err(e) => {
                warn!("[SCAN] {}", e);
                Vec::new()
            }
        }
    }

    /// Scans once and logs every device that answered. Does not fill the cache.
    pub async fn inventory(&self) {
        info!("[SCAN] Scanning the network for Tuya devices...");
        let devices = self.scan_all().await;
        if devices.is_empty() {
            info!("[SCAN] No Tuya devices found.");
            return;
        }

        info!("[SCAN] {} device(s) found:", devices.len());
        for dev in &devices {
            info!(
                "[SCAN] gwId={}  ip={}  ver={}",
                dev.id,
                dev.ip,
                dev.version.map(|v| v.as_str()).unwrap_or("?")
            );
        }
    }

    /// Returns the LAN IP of `device_id`, scanning the network on a cache miss.
    pub async fn resolve(&self, device_id: &str) -> Option<String> {
        match self.lookup(device_id).await {
            Ok(ip) => Some(ip),
            Err(e) => {
                warn!("[DISCOVER] {}", e);
                None
            }
        }
    }

    async fn lookup(&self, device_id: &str) -> Result<String, DirectoryError> {
        if let Some(ip) = self.cached(device_id) {
            info!("[DISCOVER] Using cached IP for {}: {}", device_id, ip);
            return Ok(ip);
        }

        let _gate = self.scan_gate.lock().await;
        // Another request may have found it while we waited for the gate.
        if let Some(ip) = self.cached(device_id) {
            info!("[DISCOVER] Using cached IP for {}: {}", device_id, ip);
            return Ok(ip);
        }

        info!(
            "[DISCOVER] Scanning the network for device_id = {} ...",
            device_id
        );
        let devices = self.try_scan().await?;
        info!("[DISCOVER] Scan found {} device(s).", devices.len());

        let mut matches = devices.iter().filter(|dev| {
            debug!("[DISCOVER] Seen gwId={} ip={}", dev.id, dev.ip);
            dev.id == device_id
        });
        let found = matches
            .next()
            .ok_or_else(|| DirectoryError::NotFound(device_id.to_string()))?;

        let rivals: Vec<&str> = matches
            .map(|dev| dev.ip.as_str())
            .filter(|ip| *ip != found.ip)
            .collect();
        if !rivals.is_empty() {
            warn!(
                "[DISCOVER] Device {} answered from several IPs; using {} and ignoring {:?}",
                device_id, found.ip, rivals
            );
        }

        info!(
            "[DISCOVER] Found device_id={} ip={} ver={:?}",
            found.id, found.ip, found.version
        );
        self.cache
            .lock()
            .insert(device_id.to_string(), found.ip.clone());
        Ok(found.ip.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::protocol::Version;
    use std::future::Future;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FakeScan {
        calls: Arc<AtomicUsize>,
        devices: Vec<DiscoveryResult>,
        fail: bool,
        delay: Duration,
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl FakeScan {
        fn new(devices: Vec<DiscoveryResult>) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let fake = Self {
                calls: calls.clone(),
                devices,
                fail: false,
                delay: Duration::ZERO,
                in_flight: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
            };
            (fake, calls)
        }
    }

    impl Discovery for FakeScan {
        fn scan(&self) -> impl Future<Output = Result<Vec<DiscoveryResult>>> + Send {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let outcome = if self.fail {
                Err(TuyaError::Io("No available ports for scanning".into()))
            } else {
                Ok(self.devices.clone())
            };
            let delay = self.delay;
            let (in_flight, peak) = (self.in_flight.clone(), self.peak.clone());
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                outcome
            }
        }
    }

    fn record(id: &str, ip: &str) -> DiscoveryResult {
        DiscoveryResult {
            id: id.to_string(),
            ip: ip.to_string(),
            version: Some(Version::V3_3),
            product_key: None,
        }
    }

    #[tokio::test]
    async fn cached_lookup_does_not_scan() {
        let (fake, calls) = FakeScan::new(vec![record("abc", "10.0.0.5")]);
        let dir = DeviceDirectory::new(fake);

        assert_eq!(dir.resolve("abc").await.as_deref(), Some("10.0.0.5"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert_eq!(dir.resolve("abc").await.as_deref(), Some("10.0.0.5"));
        assert_eq!(dir.resolve("abc").await.as_deref(), Some("10.0.0.5"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_device_is_not_found_and_not_cached() {
        let (fake, calls) = FakeScan::new(vec![record("other", "10.0.0.7")]);
        let dir = DeviceDirectory::new(fake);

        assert_eq!(dir.resolve("abc").await, None);
        assert_eq!(dir.resolve("abc").await, None);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(dir.cache_len(), 0);
    }

    #[tokio::test]
    async fn only_the_requested_device_is_cached() {
        let (fake, _) = FakeScan::new(vec![record("one", "10.0.0.1"), record("two", "10.0.0.2")]);
        let dir = DeviceDirectory::new(fake);

        assert_eq!(dir.resolve("two").await.as_deref(), Some("10.0.0.2"));
        assert_eq!(dir.cached("one"), None);
        assert_eq!(dir.cached("two").as_deref(), Some("10.0.0.2"));
    }

    #[tokio::test]
    async fn scan_failure_downgrades_to_not_found() {
        let (mut fake, calls) = FakeScan::new(Vec::new());
        fake.fail = true;
        let dir = DeviceDirectory::new(fake);

        assert!(dir.scan_all().await.is_empty());
        assert_eq!(dir.resolve("abc").await, None);
        assert!(matches!(
            dir.lookup("abc").await,
            Err(DirectoryError::ScanFailed(_))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn duplicate_ids_resolve_to_first_seen() {
        let (fake, _) = FakeScan::new(vec![record("abc", "10.0.0.5"), record("abc", "10.0.0.6")]);
        let dir = DeviceDirectory::new(fake);

        assert_eq!(dir.resolve("abc").await.as_deref(), Some("10.0.0.5"));
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_scan() {
        let (mut fake, calls) = FakeScan::new(vec![record("abc", "10.0.0.5")]);
        fake.delay = Duration::from_millis(50);
        let dir = Arc::new(DeviceDirectory::new(fake));

        let lookups: Vec<_> = (0..4)
            .map(|_| {
                let dir = dir.clone();
                tokio::spawn(async move { dir.resolve("abc").await })
            })
            .collect();
        for lookup in lookups {
            assert_eq!(lookup.await.unwrap().as_deref(), Some("10.0.0.5"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn inventory_leaves_cache_empty() {
        let (fake, calls) = FakeScan::new(vec![record("abc", "10.0.0.5")]);
        let dir = DeviceDirectory::new(fake);

        dir.inventory().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dir.cache_len(), 0);
    }

    #[tokio::test]
    async fn inventory_and_lookup_never_scan_at_once() {
        let (mut fake, calls) = FakeScan::new(vec![record("abc", "10.0.0.5")]);
        fake.delay = Duration::from_millis(50);
        let peak = fake.peak.clone();
        let dir = DeviceDirectory::new(fake);

        let (_, ip) = tokio::join!(dir.inventory(), dir.resolve("abc"));
        assert_eq!(ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
