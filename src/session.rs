use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use crate::{
    auth::{self, AuthKey},
    device::{DeviceDriver, DriverContext, DriverRegistry},
    discovery::DeviceScanner,
    error::{BandError, Result},
    protocol::{bt_uuid, CHAR_AUTH},
    state::{ConnectionState, ConnectionSupervisor, StateMachine},
    transport::{BtleplugTransport, Transport},
    types::{
        Capabilities, DeviceCandidate, DeviceEvents, DeviceInfo, DeviceType, PairingOptions,
        Timeouts,
    },
};

/// One live pairing with a device
///
/// Sessions are handed out as `Arc` by [`BandManager`]; all operations check
/// the lifecycle state and fail with [`BandError::Disconnected`] when the
/// session is not READY.
pub struct Session {
    address: String,
    device_type: DeviceType,
    machine: Arc<StateMachine>,
    transport: Arc<dyn Transport>,
    driver: Arc<dyn DeviceDriver>,
    supervisor: ConnectionSupervisor,
}

impl Session {
    /// Device address this session is bound to
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Protocol generation of the paired device
    #[must_use]
    pub const fn device_type(&self) -> DeviceType {
        self.device_type
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    /// Whether commands can be issued right now
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.machine.state().is_operational()
    }

    /// Feature support of the paired model
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.driver.capabilities()
    }

    fn require_ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(BandError::Disconnected {
                address: self.address.clone(),
            })
        }
    }

    /// Trigger a manual heart-rate measurement
    ///
    /// # Errors
    ///
    /// Fails when the session is not READY or the model has no sensor.
    pub async fn start_heart_rate(&self) -> Result<()> {
        self.require_ready()?;
        self.driver.start_heart_rate().await
    }

    /// Stop an in-flight heart-rate measurement
    pub async fn stop_heart_rate(&self) -> Result<()> {
        self.require_ready()?;
        self.driver.stop_heart_rate().await
    }

    /// Turn realtime step notifications on or off
    pub async fn set_realtime_steps(&self, enabled: bool) -> Result<()> {
        self.require_ready()?;
        self.driver.set_realtime_steps(enabled).await
    }

    /// Request stored activity data
    pub async fn fetch_activity(&self) -> Result<()> {
        self.require_ready()?;
        self.driver.fetch_activity().await
    }

    /// Sync the device clock to the host clock
    pub async fn set_time(&self) -> Result<()> {
        self.require_ready()?;
        self.driver.set_time().await
    }

    /// Push a text notification to the display
    pub async fn send_notification(&self, message: &str) -> Result<()> {
        self.require_ready()?;
        self.driver.send_notification(message).await
    }

    /// Make the device vibrate so it can be found
    pub async fn find_device(&self) -> Result<()> {
        self.require_ready()?;
        self.driver.find_device().await
    }

    /// Battery percentage, when the device reports one
    pub async fn battery_level(&self) -> Result<Option<u8>> {
        self.require_ready()?;
        self.driver.battery_level().await
    }

    /// Firmware, hardware and serial details
    pub async fn device_info(&self) -> Result<DeviceInfo> {
        self.require_ready()?;
        self.driver.device_info().await
    }

    async fn teardown(&self) {
        self.supervisor.shutdown();
        self.driver.shutdown().await;
        if let Err(e) = self.transport.disconnect().await {
            warn!(address = %self.address, error = %e, "disconnect failed");
        }
        self.machine.force_disconnected();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("address", &self.address)
            .field("device_type", &self.device_type)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// One session slot per address; pending while pairing is in flight
type SessionCell = Arc<OnceCell<Arc<Session>>>;

/// Owns every session and enforces one connection per device
///
/// All collaborators are injected, so consumers can swap the driver registry
/// or the event sink without touching the manager.
pub struct BandManager {
    registry: DriverRegistry,
    events: Arc<dyn DeviceEvents>,
    timeouts: Timeouts,
    sessions: Mutex<HashMap<String, SessionCell>>,
}

impl BandManager {
    /// Create a manager with the given collaborators
    #[must_use]
    pub fn new(registry: DriverRegistry, events: Arc<dyn DeviceEvents>, timeouts: Timeouts) -> Self {
        Self {
            registry,
            events,
            timeouts,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Pair with a device over the given transport
    ///
    /// Pairing is idempotent: a second call for the same address returns the
    /// existing session without opening another connection, including calls
    /// racing each other.
    ///
    /// # Errors
    ///
    /// Returns [`BandError::InvalidAuthKey`] before any connection attempt
    /// when the key is malformed, [`BandError::ConnectionFailed`] when the
    /// link cannot be established, and
    /// [`BandError::AuthenticationFailed`] when the device rejects the key.
    pub async fn pair(
        &self,
        transport: Arc<dyn Transport>,
        device_type: DeviceType,
        options: &PairingOptions,
    ) -> Result<Arc<Session>> {
        let address = transport.address();
        let key = match &options.auth_key {
            Some(hex) => Some(AuthKey::parse(hex)?),
            None => None,
        };
        let device_type = options.device_type.unwrap_or(device_type);
        if device_type == DeviceType::Unknown {
            return Err(BandError::DeviceNotSupported { address });
        }

        // Concurrent pairs for one address collapse onto one cell, which
        // serializes the connection attempt without blocking the rest of
        // the manager behind a slow transport.
        let cell = {
            let mut sessions = self.sessions.lock().await;
            Arc::clone(sessions.entry(address.clone()).or_default())
        };
        if let Some(existing) = cell.get() {
            debug!(address = %address, "pairing requested for existing session");
            return Ok(Arc::clone(existing));
        }

        self.events.on_pairing_state_change(true, &address);
        let result = cell
            .get_or_try_init(|| async {
                self.establish(Arc::clone(&transport), device_type, key, options)
                    .await
                    .map(Arc::new)
            })
            .await
            .map(Arc::clone);
        self.events.on_pairing_state_change(false, &address);

        match result {
            Ok(session) => {
                // A failed racer may have pruned the slot before we finished.
                let mut sessions = self.sessions.lock().await;
                sessions.entry(address).or_insert_with(|| Arc::clone(&cell));
                Ok(session)
            }
            Err(e) => {
                {
                    let mut sessions = self.sessions.lock().await;
                    if let Some(entry) = sessions.get(&address) {
                        if Arc::ptr_eq(entry, &cell) && entry.get().is_none() {
                            sessions.remove(&address);
                        }
                    }
                }
                let _ = transport.disconnect().await;
                self.events.on_error(&e, Some(&address));
                Err(e)
            }
        }
    }

    /// Pair with a device found by a scanner
    ///
    /// # Errors
    ///
    /// Returns [`BandError::DeviceNotFound`] when the candidate's peripheral
    /// is no longer known to the scanner, plus everything [`Self::pair`] can
    /// return.
    pub async fn pair_discovered(
        &self,
        scanner: &DeviceScanner,
        candidate: &DeviceCandidate,
        options: &PairingOptions,
    ) -> Result<Arc<Session>> {
        let peripheral = scanner
            .peripheral(&candidate.id)
            .await
            .ok_or(BandError::DeviceNotFound)?;
        let transport: Arc<dyn Transport> = Arc::new(BtleplugTransport::new(peripheral));
        self.pair(transport, candidate.device_type, options).await
    }

    async fn establish(
        &self,
        transport: Arc<dyn Transport>,
        device_type: DeviceType,
        key: Option<AuthKey>,
        options: &PairingOptions,
    ) -> Result<Session> {
        let address = transport.address();
        let machine = Arc::new(StateMachine::new(address.clone()));

        {
            let events = Arc::clone(&self.events);
            let observer_address = address.clone();
            machine.observe(move |state| match state {
                ConnectionState::Ready => {
                    events.on_connection_state_change(true, &observer_address);
                }
                ConnectionState::Disconnected => {
                    events.on_connection_state_change(false, &observer_address);
                }
                _ => {}
            });
        }

        let mut timeouts = self.timeouts.clone();
        if let Some(timeout_ms) = options.timeout_ms {
            timeouts.connection_ms = timeout_ms;
        }

        // Only keyed devices that want the handshake get one.
        let handshake_key = key.filter(|_| device_type.capabilities().auth);

        establish_link(&*transport, &machine, handshake_key.as_ref(), &timeouts).await?;

        let driver: Arc<dyn DeviceDriver> = Arc::from(self.registry.create(DriverContext {
            transport: Arc::clone(&transport),
            device_type,
            events: Arc::clone(&self.events),
        })?);
        driver.initialize().await?;
        machine.transition(ConnectionState::Ready)?;
        info!(address = %address, model = %device_type, "session ready");

        let supervisor = {
            let probe_transport = Arc::clone(&transport);
            let reconnect_transport = Arc::clone(&transport);
            let reconnect_machine = Arc::clone(&machine);
            let reconnect_driver = Arc::clone(&driver);
            let reconnect_timeouts = timeouts.clone();
            let events = Arc::clone(&self.events);

            ConnectionSupervisor::spawn(
                Arc::clone(&machine),
                Duration::from_millis(timeouts.reconnect_interval_ms),
                Duration::from_millis(timeouts.liveness_interval_ms),
                timeouts.max_reconnect_attempts,
                move || {
                    let transport = Arc::clone(&probe_transport);
                    async move { transport.is_connected().await }
                },
                move || {
                    let transport = Arc::clone(&reconnect_transport);
                    let machine = Arc::clone(&reconnect_machine);
                    let driver = Arc::clone(&reconnect_driver);
                    let timeouts = reconnect_timeouts.clone();
                    let events = Arc::clone(&events);
                    async move {
                        let result = async {
                            establish_link(&*transport, &machine, handshake_key.as_ref(), &timeouts)
                                .await?;
                            driver.initialize().await?;
                            machine.transition(ConnectionState::Ready)
                        }
                        .await;
                        if let Err(e) = &result {
                            // Exhausted or failed attempts park the session
                            // in DISCONNECTED, never in ERROR limbo.
                            machine.force_disconnected();
                            events.on_error(e, Some(&transport.address()));
                        }
                        result
                    }
                },
            )
        };

        Ok(Session {
            address,
            device_type,
            machine,
            transport,
            driver,
            supervisor,
        })
    }

    /// Session for a device, if one exists
    pub async fn session(&self, address: &str) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .await
            .get(address)
            .and_then(|cell| cell.get().cloned())
    }

    /// All live sessions
    pub async fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .lock()
            .await
            .values()
            .filter_map(|cell| cell.get().cloned())
            .collect()
    }

    /// Tear down the session for a device
    ///
    /// # Errors
    ///
    /// Returns [`BandError::DeviceNotFound`] when no session exists for the
    /// address. A pairing still in flight is not a session yet.
    pub async fn unpair(&self, address: &str) -> Result<()> {
        let session = {
            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions.get(address).and_then(|cell| cell.get().cloned()) else {
                return Err(BandError::DeviceNotFound);
            };
            sessions.remove(address);
            session
        };
        info!(address = %address, "unpairing");
        session.teardown().await;
        Ok(())
    }

    /// Tear down every session
    pub async fn unpair_all(&self) {
        let cells: Vec<_> = self.sessions.lock().await.drain().collect();
        for (_, cell) in cells {
            if let Some(session) = cell.get() {
                session.teardown().await;
            }
        }
    }
}

/// Drive the transport through connect, service discovery and the handshake
async fn establish_link(
    transport: &dyn Transport,
    machine: &StateMachine,
    key: Option<&AuthKey>,
    timeouts: &Timeouts,
) -> Result<()> {
    let address = transport.address();
    machine.transition(ConnectionState::Connecting)?;

    let connected = transport
        .connect(Duration::from_millis(timeouts.connection_ms))
        .await;
    if let Err(e) = connected {
        let _ = machine.transition(ConnectionState::Error);
        return Err(e);
    }
    machine.transition(ConnectionState::Connected)?;
    transport.discover_services().await?;

    if let Some(key) = key {
        machine.transition(ConnectionState::Authenticating)?;
        let mut responses = transport.subscribe(bt_uuid(CHAR_AUTH)).await?;
        let outcome = auth::perform(
            transport,
            &mut responses,
            key,
            Duration::from_millis(timeouts.authentication_ms),
        )
        .await;
        let _ = transport.unsubscribe(bt_uuid(CHAR_AUTH)).await;

        if let Err(e) = outcome {
            let _ = machine.transition(ConnectionState::Error);
            let _ = transport.disconnect().await;
            return Err(e);
        }
        machine.transition(ConnectionState::Authenticated)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::send_key_frame,
        protocol::CHAR_HEART_RATE_DATA,
        transport::mock::MockTransport,
        types::{BandEventRecorder, NoopEvents},
    };

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";
    const OTHER_ADDRESS: &str = "11:22:33:44:55:66";

    fn manager() -> BandManager {
        BandManager::new(
            DriverRegistry::default(),
            Arc::new(NoopEvents),
            Timeouts::default(),
        )
    }

    fn manager_with(events: Arc<dyn DeviceEvents>) -> BandManager {
        BandManager::new(DriverRegistry::default(), events, Timeouts::default())
    }

    #[tokio::test]
    async fn test_pair_without_key_reaches_ready() {
        let manager = manager();
        let transport = Arc::new(MockTransport::new(ADDRESS, vec![]));

        let session = manager
            .pair(transport.clone(), DeviceType::MiBand5, &PairingOptions::default())
            .await
            .unwrap();

        assert!(session.is_ready());
        assert_eq!(session.device_type(), DeviceType::MiBand5);
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_pair_is_idempotent() {
        let manager = manager();
        let transport = Arc::new(MockTransport::new(ADDRESS, vec![]));

        let first = manager
            .pair(transport.clone(), DeviceType::MiBand5, &PairingOptions::default())
            .await
            .unwrap();
        let second = manager
            .pair(transport.clone(), DeviceType::MiBand5, &PairingOptions::default())
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_pairs_share_one_connection() {
        let manager = Arc::new(manager());
        let transport = Arc::new(MockTransport::new(ADDRESS, vec![]));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let manager = Arc::clone(&manager);
            let transport = transport.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .pair(transport, DeviceType::MiBand5, &PairingOptions::default())
                    .await
            }));
        }

        let mut sessions = Vec::new();
        for handle in handles {
            sessions.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(transport.connect_count(), 1);
        for session in &sessions[1..] {
            assert!(Arc::ptr_eq(&sessions[0], session));
        }
    }

    #[tokio::test]
    async fn test_slow_pairing_does_not_block_the_manager() {
        let manager = Arc::new(manager());
        let slow = Arc::new(MockTransport::new(ADDRESS, vec![]));
        let release = slow.gate_next_connect();

        let pair_manager = Arc::clone(&manager);
        let pair_slow = slow.clone();
        let handle = tokio::spawn(async move {
            pair_manager
                .pair(pair_slow, DeviceType::MiBand5, &PairingOptions::default())
                .await
        });

        // Wait until the slow pairing is parked inside connect.
        for _ in 0..100 {
            if slow.connect_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(slow.connect_count(), 1);

        // Another device pairs to completion while the first is stuck.
        let other = Arc::new(MockTransport::new(OTHER_ADDRESS, vec![]));
        let session = manager
            .pair(other, DeviceType::MiBand5, &PairingOptions::default())
            .await
            .unwrap();
        assert!(session.is_ready());
        assert_eq!(manager.sessions().await.len(), 1);

        release.send(()).unwrap();
        let slow_session = handle.await.unwrap().unwrap();
        assert!(slow_session.is_ready());
        assert_eq!(manager.sessions().await.len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_key_fails_before_connecting() {
        let manager = manager();
        let transport = Arc::new(MockTransport::new(ADDRESS, vec![]));

        let options = PairingOptions {
            auth_key: Some("not-a-key".to_string()),
            ..PairingOptions::default()
        };
        let err = manager
            .pair(transport.clone(), DeviceType::MiBand5, &options)
            .await
            .unwrap_err();

        assert!(matches!(err, BandError::InvalidAuthKey(_)));
        assert_eq!(transport.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_pair_with_key_runs_handshake() {
        let manager = Arc::new(manager());
        let transport = Arc::new(MockTransport::new(ADDRESS, vec![]));
        let key_hex = "00112233445566778899aabbccddeeff";

        let options = PairingOptions {
            auth_key: Some(key_hex.to_string()),
            ..PairingOptions::default()
        };
        let pair_manager = Arc::clone(&manager);
        let pair_transport = transport.clone();
        let handle = tokio::spawn(async move {
            pair_manager
                .pair(pair_transport, DeviceType::MiBand6, &options)
                .await
        });

        // Wait for the key frame, then let the device accept outright.
        for _ in 0..100 {
            if !transport.writes().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        transport.notify(bt_uuid(CHAR_AUTH), vec![0x00, 0x03]);

        let session = handle.await.unwrap().unwrap();
        assert!(session.is_ready());

        let key = AuthKey::parse(key_hex).unwrap();
        assert_eq!(transport.writes()[0].1, send_key_frame(&key).to_vec());
    }

    #[tokio::test]
    async fn test_missing_telemetry_characteristic_aborts_pairing() {
        let manager = manager();
        let transport = Arc::new(MockTransport::new(ADDRESS, vec![]));
        transport.fail_subscribe(bt_uuid(CHAR_HEART_RATE_DATA));

        let err = manager
            .pair(transport, DeviceType::MiBand5, &PairingOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, BandError::CharacteristicNotFound { .. }));
        assert!(manager.session(ADDRESS).await.is_none());
    }

    #[tokio::test]
    async fn test_rejected_handshake_fails_pairing() {
        let recorder = Arc::new(BandEventRecorder::default());
        let manager = Arc::new(manager_with(recorder.clone()));
        let transport = Arc::new(MockTransport::new(ADDRESS, vec![]));

        let options = PairingOptions {
            auth_key: Some("00112233445566778899aabbccddeeff".to_string()),
            ..PairingOptions::default()
        };
        let pair_manager = Arc::clone(&manager);
        let pair_transport = transport.clone();
        let handle = tokio::spawn(async move {
            pair_manager
                .pair(pair_transport, DeviceType::MiBand6, &options)
                .await
        });

        for _ in 0..100 {
            if !transport.writes().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        transport.notify(bt_uuid(CHAR_AUTH), vec![0x01, 0x03]);

        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_auth_failure());
        assert!(manager.session(ADDRESS).await.is_none());
        assert_eq!(recorder.errors().len(), 1);
    }

    #[tokio::test]
    async fn test_gen1_skips_handshake_even_with_key() {
        let manager = manager();
        let transport = Arc::new(MockTransport::new(ADDRESS, vec![]));

        let options = PairingOptions {
            auth_key: Some("00112233445566778899aabbccddeeff".to_string()),
            ..PairingOptions::default()
        };
        let session = manager
            .pair(transport.clone(), DeviceType::MiBand1, &options)
            .await
            .unwrap();

        assert!(session.is_ready());
        // No auth frames on the wire.
        assert!(transport
            .writes()
            .iter()
            .all(|(uuid, _)| *uuid != bt_uuid(CHAR_AUTH)));
    }

    #[tokio::test]
    async fn test_connection_failure_surfaces_and_leaves_no_session() {
        let manager = manager();
        let transport = Arc::new(MockTransport::new(ADDRESS, vec![]));
        transport.fail_next_connects(true);

        let err = manager
            .pair(transport, DeviceType::MiBand5, &PairingOptions::default())
            .await
            .unwrap_err();

        assert!(err.is_connection_error());
        assert!(manager.session(ADDRESS).await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_device_type_rejected() {
        let manager = manager();
        let transport = Arc::new(MockTransport::new(ADDRESS, vec![]));

        let err = manager
            .pair(transport, DeviceType::Unknown, &PairingOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BandError::DeviceNotSupported { .. }));
    }

    #[tokio::test]
    async fn test_commands_require_ready() {
        let manager = manager();
        let transport = Arc::new(MockTransport::new(ADDRESS, vec![]));

        let session = manager
            .pair(transport.clone(), DeviceType::MiBand5, &PairingOptions::default())
            .await
            .unwrap();
        session.start_heart_rate().await.unwrap();

        manager.unpair(ADDRESS).await.unwrap();
        let err = session.start_heart_rate().await.unwrap_err();
        assert!(matches!(err, BandError::Disconnected { .. }));
    }

    #[tokio::test]
    async fn test_unpair_tears_down() {
        let manager = manager();
        let transport = Arc::new(MockTransport::new(ADDRESS, vec![]));

        let session = manager
            .pair(transport.clone(), DeviceType::MiBand5, &PairingOptions::default())
            .await
            .unwrap();
        manager.unpair(ADDRESS).await.unwrap();

        assert!(!transport.is_connected().await);
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(manager.session(ADDRESS).await.is_none());
        assert!(manager.unpair(ADDRESS).await.is_err());
    }

    #[tokio::test]
    async fn test_connection_events_fire() {
        let recorder = Arc::new(BandEventRecorder::default());
        let manager = manager_with(recorder.clone());
        let transport = Arc::new(MockTransport::new(ADDRESS, vec![]));

        manager
            .pair(transport, DeviceType::MiBand5, &PairingOptions::default())
            .await
            .unwrap();
        manager.unpair(ADDRESS).await.unwrap();

        let changes = recorder.connection_changes();
        assert_eq!(changes.first(), Some(&(true, ADDRESS.to_string())));
        assert_eq!(changes.last(), Some(&(false, ADDRESS.to_string())));
    }

    // The reconnect poll is pushed far out so only the liveness probe fires
    // inside the advanced window.
    fn supervision_timeouts() -> Timeouts {
        Timeouts {
            liveness_interval_ms: 10_000,
            reconnect_interval_ms: 60_000,
            ..Timeouts::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_drops_session_to_disconnected() {
        let manager = BandManager::new(
            DriverRegistry::default(),
            Arc::new(NoopEvents),
            supervision_timeouts(),
        );
        let transport = Arc::new(MockTransport::new(ADDRESS, vec![]));

        let session = manager
            .pair(transport.clone(), DeviceType::MiBand5, &PairingOptions::default())
            .await
            .unwrap();
        assert!(session.is_ready());

        transport.drop_link();
        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;

        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_reconnects_session() {
        let manager = BandManager::new(
            DriverRegistry::default(),
            Arc::new(NoopEvents),
            supervision_timeouts(),
        );
        let transport = Arc::new(MockTransport::new(ADDRESS, vec![]));

        let session = manager
            .pair(transport.clone(), DeviceType::MiBand5, &PairingOptions::default())
            .await
            .unwrap();

        transport.drop_link();
        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);

        // Next reconnect poll restores the session.
        tokio::time::advance(Duration::from_secs(50)).await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert!(session.is_ready());
        assert!(transport.connect_count() >= 2);
    }
}
