use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use btleplug::{
    api::{Central, Manager as _, Peripheral as _, PeripheralProperties, ScanFilter},
    platform::{Manager, Peripheral},
};
use tokio::sync::Mutex;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::{
    error::{BandError, Result},
    protocol::{
        bt_uuid, CHAR_DEVICE_NAME, SERVICE_BATTERY, SERVICE_HID, SERVICE_MIBAND, SERVICE_MIBAND2,
    },
    types::{DeviceCandidate, DeviceType},
};

/// Bluetooth SIG company identifier for Xiaomi
pub const XIAOMI_COMPANY_ID: u16 = 0x0157;

/// Signal floor below which RSSI stops contributing to classification
const RSSI_FLOOR: i16 = -80;

/// Minimum score for a signature match to be trusted
const SCORE_THRESHOLD: i32 = 20;

/// Unnamed devices weaker than this are not worth an active probe
const PROBE_RSSI_FLOOR: i16 = -70;

/// Active probes per scan
const MAX_PROBES: usize = 3;

/// Per-probe connect budget
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// What one device advertised during a scan window
#[derive(Debug, Clone, Default)]
pub struct Advertisement {
    /// Platform identifier
    pub id: String,
    /// Advertised local name
    pub name: Option<String>,
    /// Advertised service UUIDs
    pub services: Vec<Uuid>,
    /// Manufacturer data keyed by company identifier
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// Signal strength
    pub rssi: Option<i16>,
}

impl Advertisement {
    fn from_properties(id: String, properties: &PeripheralProperties) -> Self {
        Self {
            id,
            name: properties.local_name.clone(),
            services: properties.services.clone(),
            manufacturer_data: properties.manufacturer_data.clone(),
            rssi: properties.rssi,
        }
    }

    fn advertises_service(&self, short: u16) -> bool {
        self.services.contains(&bt_uuid(short))
    }
}

struct Signature {
    device_type: DeviceType,
    name_patterns: &'static [&'static str],
    services: &'static [u16],
}

const COMMON_SERVICES: &[u16] = &[SERVICE_MIBAND, SERVICE_MIBAND2];
const GEN8_SERVICES: &[u16] = &[SERVICE_MIBAND, SERVICE_MIBAND2, SERVICE_BATTERY, SERVICE_HID];

const SIGNATURES: &[Signature] = &[
    Signature {
        device_type: DeviceType::MiBand1,
        name_patterns: &["mi band", "miband"],
        services: COMMON_SERVICES,
    },
    Signature {
        device_type: DeviceType::MiBand2,
        name_patterns: &["mi band 2", "miband 2"],
        services: COMMON_SERVICES,
    },
    Signature {
        device_type: DeviceType::MiBand3,
        name_patterns: &["mi band 3", "miband 3"],
        services: COMMON_SERVICES,
    },
    Signature {
        device_type: DeviceType::MiBand4,
        name_patterns: &["mi band 4", "miband 4"],
        services: COMMON_SERVICES,
    },
    Signature {
        device_type: DeviceType::MiBand5,
        name_patterns: &["mi band 5", "miband 5"],
        services: COMMON_SERVICES,
    },
    Signature {
        device_type: DeviceType::MiBand6,
        name_patterns: &["mi band 6", "miband 6"],
        services: COMMON_SERVICES,
    },
    Signature {
        device_type: DeviceType::MiBand7,
        name_patterns: &["mi band 7", "miband 7"],
        services: COMMON_SERVICES,
    },
    Signature {
        device_type: DeviceType::MiBand8,
        name_patterns: &[
            "mi band 8",
            "miband 8",
            "mi smart band 8",
            "smart band 8",
            "xiaomi smart band 8",
        ],
        services: GEN8_SERVICES,
    },
];

/// Score one advertisement against one model signature
#[must_use]
pub fn signature_score(advertisement: &Advertisement, device_type: DeviceType) -> i32 {
    let Some(signature) = SIGNATURES.iter().find(|s| s.device_type == device_type) else {
        return 0;
    };

    let name = advertisement
        .name
        .as_deref()
        .unwrap_or_default()
        .to_lowercase();

    let mut score = 0;
    if signature.name_patterns.iter().any(|p| name.contains(p)) {
        score += 50;
    }
    if signature
        .services
        .iter()
        .any(|&s| advertisement.advertises_service(s))
    {
        score += 30;
    }
    if advertisement
        .manufacturer_data
        .contains_key(&XIAOMI_COMPANY_ID)
    {
        score += 20;
    }
    if advertisement.rssi.is_some_and(|rssi| rssi >= RSSI_FLOOR) {
        score += 10;
    }
    score
}

/// Classify an advertisement into a protocol generation
///
/// The best-scoring signature wins when its score clears the threshold; ties
/// go to the newest generation, so "Mi Band 8" is never misread as a gen-1
/// band just because the shorter pattern also matches. Below the threshold a
/// vendor hint falls back to the newest model, and anything else is Unknown.
#[must_use]
pub fn classify(advertisement: &Advertisement) -> DeviceType {
    let mut best = (DeviceType::Unknown, 0);
    for signature in SIGNATURES {
        let score = signature_score(advertisement, signature.device_type);
        if score >= best.1 {
            best = (signature.device_type, score);
        }
    }

    if best.1 >= SCORE_THRESHOLD {
        return best.0;
    }
    if is_likely_xiaomi(advertisement) {
        return DeviceType::newest();
    }
    DeviceType::Unknown
}

/// Loose vendor heuristic used when no signature scores high enough
#[must_use]
pub fn is_likely_xiaomi(advertisement: &Advertisement) -> bool {
    const VENDOR_PATTERNS: &[&str] = &[
        "xiaomi",
        "mi band",
        "miband",
        "mi smart band",
        "smart band",
        "redmi",
        "amazfit",
        "huami",
        "band 8",
    ];
    const VENDOR_SERVICES: &[u16] = &[
        SERVICE_MIBAND,
        SERVICE_MIBAND2,
        SERVICE_BATTERY,
        SERVICE_HID,
    ];

    let name = advertisement
        .name
        .as_deref()
        .unwrap_or_default()
        .to_lowercase();

    VENDOR_PATTERNS.iter().any(|p| name.contains(p))
        || VENDOR_SERVICES
            .iter()
            .any(|&s| advertisement.advertises_service(s))
        || advertisement
            .manufacturer_data
            .contains_key(&XIAOMI_COMPANY_ID)
}

/// Whether an unnamed advertisement is strong enough to probe actively
#[must_use]
pub fn probe_worthy(advertisement: &Advertisement) -> bool {
    advertisement.name.is_none()
        && advertisement
            .rssi
            .is_some_and(|rssi| rssi > PROBE_RSSI_FLOOR)
}

/// Pick the strongest probe-worthy advertisements, capped at the probe budget
#[must_use]
pub fn select_probe_targets(advertisements: &[Advertisement]) -> Vec<String> {
    let mut targets: Vec<&Advertisement> = advertisements
        .iter()
        .filter(|a| probe_worthy(a) && classify(a) == DeviceType::Unknown)
        .collect();
    targets.sort_by_key(|a| std::cmp::Reverse(a.rssi.unwrap_or(i16::MIN)));
    targets
        .into_iter()
        .take(MAX_PROBES)
        .map(|a| a.id.clone())
        .collect()
}

/// Exclusive claim on the scanning flag, released on drop
struct ScanGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> ScanGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self> {
        if flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(BandError::ScanInProgress);
        }
        Ok(Self { flag })
    }
}

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// BLE scanner producing classified device candidates
pub struct DeviceScanner {
    manager: Manager,
    peripherals: Arc<Mutex<HashMap<String, Peripheral>>>,
    scanning: AtomicBool,
}

impl DeviceScanner {
    /// Create a scanner on the platform Bluetooth stack
    ///
    /// # Errors
    ///
    /// Returns [`BandError::Ble`] if the Bluetooth adapter cannot be
    /// initialized.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        Ok(Self {
            manager,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            scanning: AtomicBool::new(false),
        })
    }

    /// Scan for Mi Band devices
    ///
    /// Returns candidates deduplicated by id, sorted strongest first, with
    /// unrecognized devices filtered out. Strong unnamed devices get an
    /// active probe before being dropped.
    ///
    /// # Errors
    ///
    /// Returns [`BandError::ScanInProgress`] when a scan is already running,
    /// [`BandError::DeviceNotFound`] when no adapter is available, or
    /// [`BandError::Ble`] for stack failures.
    pub async fn scan(&self, window: Duration) -> Result<Vec<DeviceCandidate>> {
        let _guard = ScanGuard::acquire(&self.scanning)?;
        self.scan_inner(window).await
    }

    async fn scan_inner(&self, window: Duration) -> Result<Vec<DeviceCandidate>> {
        info!("starting scan for Mi Band devices");

        let adapters = self.manager.adapters().await?;
        let Some(central) = adapters.first() else {
            return Err(BandError::DeviceNotFound);
        };

        // No service filter: gen-8 bands do not always advertise the vendor
        // service, so unnamed devices must survive until the probe pass.
        central.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(window).await;
        central.stop_scan().await?;

        let mut advertisements = Vec::new();
        let mut seen = HashMap::new();
        for peripheral in central.peripherals().await? {
            let id = peripheral.address().to_string();
            if seen.contains_key(&id) {
                continue;
            }
            if let Ok(Some(properties)) = peripheral.properties().await {
                advertisements.push(Advertisement::from_properties(id.clone(), &properties));
            }
            seen.insert(id.clone(), peripheral.clone());
            self.peripherals.lock().await.insert(id, peripheral);
        }

        for target in select_probe_targets(&advertisements) {
            if let Some(peripheral) = seen.get(&target) {
                if let Some(refined) = self.probe(peripheral).await {
                    if let Some(slot) = advertisements.iter_mut().find(|a| a.id == target) {
                        slot.name = refined.name.or(slot.name.take());
                        slot.services.extend(refined.services);
                    }
                }
            }
        }

        let mut candidates: Vec<DeviceCandidate> = advertisements
            .iter()
            .map(|advertisement| DeviceCandidate {
                id: advertisement.id.clone(),
                name: advertisement
                    .name
                    .clone()
                    .unwrap_or_else(|| "Unknown Device".to_string()),
                address: advertisement.id.clone(),
                rssi: advertisement.rssi,
                device_type: classify(advertisement),
                is_connected: false,
            })
            .filter(|candidate| candidate.device_type != DeviceType::Unknown)
            .collect();
        candidates.sort_by_key(|c| std::cmp::Reverse(c.rssi.unwrap_or(-100)));

        info!("scan completed, found {} candidate(s)", candidates.len());
        Ok(candidates)
    }

    /// Connect briefly to read the GAP name and service list
    ///
    /// Probe failures are swallowed; a device that cannot be probed simply
    /// stays unclassified.
    async fn probe(&self, peripheral: &Peripheral) -> Option<Advertisement> {
        let id = peripheral.address().to_string();
        debug!(device = %id, "probing unnamed device");

        let connect = tokio::time::timeout(PROBE_TIMEOUT, peripheral.connect()).await;
        if !matches!(connect, Ok(Ok(()))) {
            trace!(device = %id, "probe connect failed");
            return None;
        }

        let mut refined = Advertisement {
            id: id.clone(),
            ..Advertisement::default()
        };
        if peripheral.discover_services().await.is_ok() {
            refined.services = peripheral.services().iter().map(|s| s.uuid).collect();
            let name_char = peripheral
                .services()
                .iter()
                .flat_map(|s| s.characteristics.iter())
                .find(|c| c.uuid == bt_uuid(CHAR_DEVICE_NAME))
                .cloned();
            if let Some(name_char) = name_char {
                if let Ok(value) = peripheral.read(&name_char).await {
                    if let Ok(name) = String::from_utf8(value) {
                        if !name.is_empty() {
                            refined.name = Some(name);
                        }
                    }
                }
            }
        }

        let _ = peripheral.disconnect().await;
        Some(refined)
    }

    /// Peripheral handle for a previously scanned device
    pub async fn peripheral(&self, id: &str) -> Option<Peripheral> {
        self.peripherals.lock().await.get(id).cloned()
    }

    /// Already-paired Mi Band devices known to the platform stack
    ///
    /// # Errors
    ///
    /// Returns [`BandError::DeviceNotFound`] when no adapter is available.
    pub async fn bonded_devices(&self) -> Result<Vec<DeviceCandidate>> {
        let adapters = self.manager.adapters().await?;
        let Some(central) = adapters.first() else {
            return Err(BandError::DeviceNotFound);
        };

        let mut candidates = Vec::new();
        for peripheral in central.peripherals().await? {
            if !peripheral.is_connected().await.unwrap_or(false) {
                continue;
            }
            let id = peripheral.address().to_string();
            if let Ok(Some(properties)) = peripheral.properties().await {
                let advertisement = Advertisement::from_properties(id.clone(), &properties);
                let device_type = classify(&advertisement);
                if device_type != DeviceType::Unknown {
                    self.peripherals
                        .lock()
                        .await
                        .insert(id.clone(), peripheral.clone());
                    candidates.push(DeviceCandidate {
                        id: id.clone(),
                        name: advertisement
                            .name
                            .unwrap_or_else(|| "Unknown Device".to_string()),
                        address: id,
                        rssi: advertisement.rssi,
                        device_type,
                        is_connected: true,
                    });
                }
            }
        }
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(name: &str) -> Advertisement {
        Advertisement {
            id: "test".to_string(),
            name: Some(name.to_string()),
            ..Advertisement::default()
        }
    }

    #[test]
    fn test_classification_by_name() {
        assert_eq!(classify(&named("Mi Band 8")), DeviceType::MiBand8);
        assert_eq!(classify(&named("MI BAND 8")), DeviceType::MiBand8);
        assert_eq!(classify(&named("Xiaomi Smart Band 8")), DeviceType::MiBand8);
        assert_eq!(classify(&named("Mi Band 5")), DeviceType::MiBand5);
        assert_eq!(classify(&named("miband 3")), DeviceType::MiBand3);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let advertisement = named("Mi Band 7");
        let first = classify(&advertisement);
        for _ in 0..10 {
            assert_eq!(classify(&advertisement), first);
        }
    }

    #[test]
    fn test_full_signature_scores_80() {
        let advertisement = Advertisement {
            id: "test".to_string(),
            name: Some("Mi Band 8".to_string()),
            services: vec![bt_uuid(SERVICE_MIBAND)],
            manufacturer_data: HashMap::new(),
            rssi: Some(-60),
        };
        assert_eq!(signature_score(&advertisement, DeviceType::MiBand8), 90);
        assert_eq!(classify(&advertisement), DeviceType::MiBand8);

        let weak = Advertisement {
            rssi: Some(-90),
            ..advertisement
        };
        assert_eq!(signature_score(&weak, DeviceType::MiBand8), 80);
    }

    #[test]
    fn test_manufacturer_hint_falls_back_to_newest() {
        let advertisement = Advertisement {
            id: "test".to_string(),
            name: None,
            services: vec![],
            manufacturer_data: HashMap::from([(XIAOMI_COMPANY_ID, vec![0x01, 0x02])]),
            rssi: Some(-90),
        };
        // Manufacturer alone scores 20, which clears the threshold.
        assert_eq!(classify(&advertisement), DeviceType::newest());
    }

    #[test]
    fn test_vendor_name_without_signature_falls_back() {
        let advertisement = named("Redmi Watch");
        assert_eq!(classify(&advertisement), DeviceType::newest());
    }

    #[test]
    fn test_unrelated_device_is_unknown() {
        let advertisement = Advertisement {
            id: "test".to_string(),
            name: Some("JBL Flip 6".to_string()),
            services: vec![bt_uuid(0x110B)],
            manufacturer_data: HashMap::from([(0x0075, vec![0x42])]),
            rssi: Some(-50),
        };
        assert_eq!(classify(&advertisement), DeviceType::Unknown);
    }

    #[test]
    fn test_service_only_match_clears_threshold() {
        let advertisement = Advertisement {
            id: "test".to_string(),
            name: None,
            services: vec![bt_uuid(SERVICE_MIBAND)],
            manufacturer_data: HashMap::new(),
            rssi: None,
        };
        assert_ne!(classify(&advertisement), DeviceType::Unknown);
    }

    #[test]
    fn test_probe_selection() {
        let strong_unnamed = Advertisement {
            id: "a".to_string(),
            rssi: Some(-55),
            ..Advertisement::default()
        };
        let weak_unnamed = Advertisement {
            id: "b".to_string(),
            rssi: Some(-85),
            ..Advertisement::default()
        };
        let named_device = Advertisement {
            id: "c".to_string(),
            name: Some("Mi Band 8".to_string()),
            rssi: Some(-40),
            ..Advertisement::default()
        };

        assert!(probe_worthy(&strong_unnamed));
        assert!(!probe_worthy(&weak_unnamed));
        assert!(!probe_worthy(&named_device));

        let targets = select_probe_targets(&[
            strong_unnamed.clone(),
            weak_unnamed,
            named_device,
        ]);
        assert_eq!(targets, vec!["a".to_string()]);
    }

    #[test]
    fn test_probe_budget_takes_strongest() {
        let advertisements: Vec<Advertisement> = (0..6)
            .map(|i| Advertisement {
                id: format!("dev-{i}"),
                rssi: Some(-50 - i),
                ..Advertisement::default()
            })
            .collect();
        let targets = select_probe_targets(&advertisements);
        assert_eq!(targets, vec!["dev-0", "dev-1", "dev-2"]);
    }

    #[test]
    fn test_concurrent_scans_are_rejected() {
        let flag = AtomicBool::new(false);

        let first = ScanGuard::acquire(&flag).unwrap();
        assert!(matches!(
            ScanGuard::acquire(&flag),
            Err(BandError::ScanInProgress)
        ));

        drop(first);
        assert!(ScanGuard::acquire(&flag).is_ok());
    }
}
