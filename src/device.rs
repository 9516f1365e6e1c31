use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, trace, warn};

use crate::{
    codec,
    error::{BandError, Result},
    protocol::{
        self, bt_uuid, CHAR_ACTIVITY_DATA, CHAR_AUTH, CHAR_BATTERY, CHAR_BATTERY_LEVEL,
        CHAR_HEART_RATE_CONTROL, CHAR_HEART_RATE_DATA, CHAR_NOTIFICATION, CHAR_REALTIME_STEPS,
        CHAR_TIME,
    },
    transport::Transport,
    types::{Capabilities, DeviceEvents, DeviceInfo, DeviceType, HealthMetrics},
};

/// Protocol driver for one connected device
///
/// A driver owns the telemetry subscriptions and translates the wire
/// protocol into typed operations. Unsupported operations fail with
/// [`BandError::DeviceNotSupported`] instead of writing frames the device
/// would ignore.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    /// Protocol generation this driver speaks
    fn device_type(&self) -> DeviceType;

    /// Feature support of the driven model
    fn capabilities(&self) -> Capabilities;

    /// Subscribe to telemetry and start dispatching events
    async fn initialize(&self) -> Result<()>;

    /// Trigger a manual heart-rate measurement
    async fn start_heart_rate(&self) -> Result<()>;

    /// Stop an in-flight heart-rate measurement
    async fn stop_heart_rate(&self) -> Result<()>;

    /// Turn realtime step notifications on or off
    async fn set_realtime_steps(&self, enabled: bool) -> Result<()>;

    /// Request stored activity data
    async fn fetch_activity(&self) -> Result<()>;

    /// Sync the device clock to the host clock
    async fn set_time(&self) -> Result<()>;

    /// Push a text notification to the display
    async fn send_notification(&self, message: &str) -> Result<()>;

    /// Make the device vibrate so it can be found
    async fn find_device(&self) -> Result<()>;

    /// Battery percentage, when the device reports one
    async fn battery_level(&self) -> Result<Option<u8>>;

    /// Firmware, hardware and serial details
    async fn device_info(&self) -> Result<DeviceInfo>;

    /// Stop telemetry dispatch
    async fn shutdown(&self);
}

impl std::fmt::Debug for dyn DeviceDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceDriver")
            .field("device_type", &self.device_type())
            .finish_non_exhaustive()
    }
}

/// Everything a driver factory needs to build a driver
pub struct DriverContext {
    /// Link to the device
    pub transport: Arc<dyn Transport>,
    /// Classified protocol generation
    pub device_type: DeviceType,
    /// Consumer event sink
    pub events: Arc<dyn DeviceEvents>,
}

/// Constructor for a [`DeviceDriver`]
pub type DriverFactory = fn(DriverContext) -> Box<dyn DeviceDriver>;

/// Maps protocol generations to driver constructors
///
/// All known generations share the [`MiBandDriver`] by default; a consumer
/// can override individual generations with its own factory.
pub struct DriverRegistry {
    factories: HashMap<DeviceType, DriverFactory>,
}

impl DriverRegistry {
    /// Register (or replace) the factory for one generation
    pub fn register(&mut self, device_type: DeviceType, factory: DriverFactory) {
        self.factories.insert(device_type, factory);
    }

    /// Build a driver for a classified device
    ///
    /// # Errors
    ///
    /// Returns [`BandError::DeviceNotSupported`] when no factory is
    /// registered for the generation.
    pub fn create(&self, context: DriverContext) -> Result<Box<dyn DeviceDriver>> {
        let factory =
            self.factories
                .get(&context.device_type)
                .ok_or_else(|| BandError::DeviceNotSupported {
                    address: context.transport.address(),
                })?;
        Ok(factory(context))
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        let mut factories: HashMap<DeviceType, DriverFactory> = HashMap::new();
        for device_type in DeviceType::ALL {
            factories.insert(device_type, |context| Box::new(MiBandDriver::new(context)));
        }
        Self { factories }
    }
}

/// Driver for the Mi Band protocol family
pub struct MiBandDriver {
    transport: Arc<dyn Transport>,
    device_type: DeviceType,
    events: Arc<dyn DeviceEvents>,
    address: String,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl MiBandDriver {
    /// Build a driver; telemetry starts on [`DeviceDriver::initialize`]
    #[must_use]
    pub fn new(context: DriverContext) -> Self {
        let address = context.transport.address();
        Self {
            transport: context.transport,
            device_type: context.device_type,
            events: context.events,
            address,
            shutdown: Mutex::new(None),
        }
    }

    fn require(&self, supported: bool) -> Result<()> {
        if supported {
            Ok(())
        } else {
            Err(BandError::DeviceNotSupported {
                address: self.address.clone(),
            })
        }
    }

    fn spawn_pump(
        &self,
        mut heart_rate_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        mut activity_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        mut steps_rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let events = Arc::clone(&self.events);
        let address = self.address.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    value = heart_rate_rx.recv() => match value {
                        Some(value) => dispatch_heart_rate(&*events, &address, &value),
                        None => break,
                    },
                    value = activity_rx.recv() => match value {
                        Some(value) => dispatch_activity(&*events, &address, &value),
                        None => break,
                    },
                    value = recv_optional(&mut steps_rx) => match value {
                        Some(value) => dispatch_activity(&*events, &address, &value),
                        None => break,
                    },
                }
            }
            trace!(address = %address, "telemetry pump stopped");
        });
    }
}

async fn recv_optional(rx: &mut Option<mpsc::UnboundedReceiver<Vec<u8>>>) -> Option<Vec<u8>> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn dispatch_heart_rate(events: &dyn DeviceEvents, address: &str, value: &[u8]) {
    let heart_rate = match protocol::parse_heart_rate(value) {
        Some(sample) => Some(sample.heart_rate),
        None => {
            let rate = codec::parse_heart_rate_measurement(value);
            u8::try_from(rate).ok().filter(|&r| r > 0)
        }
    };

    if let Some(heart_rate) = heart_rate {
        events.on_heart_rate(heart_rate, address);
        let mut metrics = HealthMetrics::new(address);
        metrics.heart_rate = Some(heart_rate);
        events.on_health_metrics(&metrics);
    }
}

fn dispatch_activity(events: &dyn DeviceEvents, address: &str, value: &[u8]) {
    let Some(activity) = protocol::parse_activity(value) else {
        trace!(address = %address, "ignoring unrecognized activity packet");
        return;
    };

    if let Some(steps) = activity.steps {
        events.on_steps(steps, address);
    }
    if let Some(calories) = activity.calories {
        events.on_calories(calories, address);
    }
    if let Some(hours) = activity.standing_hours {
        events.on_standing_hours(hours, address);
    }

    let mut metrics = HealthMetrics::new(address);
    metrics.steps = activity.steps;
    metrics.calories = activity.calories;
    metrics.standing_hours = activity.standing_hours;
    events.on_health_metrics(&metrics);
}

#[async_trait]
impl DeviceDriver for MiBandDriver {
    fn device_type(&self) -> DeviceType {
        self.device_type
    }

    fn capabilities(&self) -> Capabilities {
        self.device_type.capabilities()
    }

    async fn initialize(&self) -> Result<()> {
        debug!(address = %self.address, model = %self.device_type, "initializing driver");

        // Heart-rate and activity telemetry are mandatory on every model
        // this driver speaks; missing characteristics are a hard failure.
        let heart_rate_rx = self
            .transport
            .subscribe(bt_uuid(CHAR_HEART_RATE_DATA))
            .await?;
        let activity_rx = self
            .transport
            .subscribe(bt_uuid(CHAR_ACTIVITY_DATA))
            .await?;

        // The dedicated steps characteristic is absent on some firmwares;
        // steps still arrive on the activity characteristic without it.
        let steps_rx = match self.transport.subscribe(bt_uuid(CHAR_REALTIME_STEPS)).await {
            Ok(rx) => Some(rx),
            Err(e) => {
                debug!(address = %self.address, error = %e, "steps characteristic unavailable");
                None
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown.lock().await = Some(shutdown_tx);
        self.spawn_pump(heart_rate_rx, activity_rx, steps_rx, shutdown_rx);
        Ok(())
    }

    async fn start_heart_rate(&self) -> Result<()> {
        self.require(self.capabilities().heart_rate)?;
        self.transport
            .write(
                bt_uuid(CHAR_HEART_RATE_CONTROL),
                &protocol::start_heart_rate_command(),
                false,
            )
            .await
    }

    async fn stop_heart_rate(&self) -> Result<()> {
        self.require(self.capabilities().heart_rate)?;
        self.transport
            .write(
                bt_uuid(CHAR_HEART_RATE_CONTROL),
                &protocol::stop_heart_rate_command(),
                false,
            )
            .await
    }

    async fn set_realtime_steps(&self, enabled: bool) -> Result<()> {
        self.require(self.capabilities().steps)?;
        let command = if enabled {
            protocol::start_realtime_steps_command()
        } else {
            protocol::stop_realtime_steps_command()
        };
        self.transport
            .write(bt_uuid(CHAR_HEART_RATE_CONTROL), &command, false)
            .await
    }

    async fn fetch_activity(&self) -> Result<()> {
        self.require(self.capabilities().steps)?;
        self.transport
            .write(
                bt_uuid(CHAR_ACTIVITY_DATA),
                &protocol::fetch_activity_command(),
                false,
            )
            .await
    }

    async fn set_time(&self) -> Result<()> {
        self.transport
            .write(bt_uuid(CHAR_TIME), &protocol::set_time_now_command(), true)
            .await
    }

    async fn send_notification(&self, message: &str) -> Result<()> {
        self.require(self.capabilities().notifications)?;
        self.transport
            .write(
                bt_uuid(CHAR_NOTIFICATION),
                &protocol::notification_command(message),
                false,
            )
            .await
    }

    async fn find_device(&self) -> Result<()> {
        self.require(self.capabilities().find)?;
        self.transport
            .write(
                bt_uuid(CHAR_NOTIFICATION),
                &protocol::find_device_command(),
                false,
            )
            .await
    }

    async fn battery_level(&self) -> Result<Option<u8>> {
        self.require(self.capabilities().battery)?;
        match self.transport.read(bt_uuid(CHAR_BATTERY)).await {
            Ok(value) => Ok(protocol::parse_battery_level(&value)),
            Err(BandError::CharacteristicNotFound { .. }) => {
                // Gen-8 bands drop the vendor characteristic for the
                // standard battery service.
                let value = self.transport.read(bt_uuid(CHAR_BATTERY_LEVEL)).await?;
                Ok(value.first().map(|&level| level.min(100)))
            }
            Err(e) => Err(e),
        }
    }

    async fn device_info(&self) -> Result<DeviceInfo> {
        let value = self.transport.read(bt_uuid(CHAR_AUTH)).await?;
        Ok(protocol::parse_device_info(&value))
    }

    async fn shutdown(&self) {
        if let Some(shutdown) = self.shutdown.lock().await.take() {
            let _ = shutdown.send(true);
        }
        for characteristic in [CHAR_HEART_RATE_DATA, CHAR_ACTIVITY_DATA, CHAR_REALTIME_STEPS] {
            if let Err(e) = self.transport.unsubscribe(bt_uuid(characteristic)).await {
                warn!(address = %self.address, error = %e, "unsubscribe failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{transport::mock::MockTransport, types::BandEventRecorder};
    use std::time::Duration;

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

    fn driver_for(device_type: DeviceType) -> (Arc<MockTransport>, MiBandDriver) {
        let transport = Arc::new(MockTransport::new(ADDRESS, vec![]));
        let driver = MiBandDriver::new(DriverContext {
            transport: Arc::clone(&transport) as Arc<dyn Transport>,
            device_type,
            events: Arc::new(crate::types::NoopEvents),
        });
        (transport, driver)
    }

    #[tokio::test]
    async fn test_command_frames_hit_expected_characteristics() {
        let (transport, driver) = driver_for(DeviceType::MiBand5);
        transport.connect(Duration::from_secs(1)).await.unwrap();

        driver.start_heart_rate().await.unwrap();
        driver.stop_heart_rate().await.unwrap();
        driver.set_realtime_steps(true).await.unwrap();
        driver.find_device().await.unwrap();

        let writes = transport.writes();
        assert_eq!(
            writes[0],
            (bt_uuid(CHAR_HEART_RATE_CONTROL), vec![0x15, 0x01, 0x01])
        );
        assert_eq!(
            writes[1],
            (bt_uuid(CHAR_HEART_RATE_CONTROL), vec![0x15, 0x01, 0x00])
        );
        assert_eq!(
            writes[2],
            (bt_uuid(CHAR_HEART_RATE_CONTROL), vec![0x15, 0x00, 0x01])
        );
        assert_eq!(writes[3], (bt_uuid(CHAR_NOTIFICATION), vec![0x08, 0x01]));
    }

    #[tokio::test]
    async fn test_capability_gating() {
        let (transport, driver) = driver_for(DeviceType::MiBand1);
        transport.connect(Duration::from_secs(1)).await.unwrap();

        let err = driver.start_heart_rate().await.unwrap_err();
        assert!(matches!(err, BandError::DeviceNotSupported { .. }));
        assert!(transport.writes().is_empty());

        // Gen 1 still counts steps and vibrates.
        driver.set_realtime_steps(true).await.unwrap();
        driver.find_device().await.unwrap();
    }

    #[tokio::test]
    async fn test_notification_is_truncated_to_packet_size() {
        let (transport, driver) = driver_for(DeviceType::MiBand6);
        transport.connect(Duration::from_secs(1)).await.unwrap();

        driver
            .send_notification("a message far longer than a single write can carry")
            .await
            .unwrap();

        let writes = transport.writes();
        assert!(writes[0].1.len() <= protocol::MAX_PACKET_SIZE);
        assert_eq!(writes[0].1[0], 0x05);
    }

    #[tokio::test]
    async fn test_battery_level_with_vendor_characteristic() {
        let (transport, driver) = driver_for(DeviceType::MiBand4);
        transport.connect(Duration::from_secs(1)).await.unwrap();
        transport.set_read_value(bt_uuid(CHAR_BATTERY), vec![0x00, 87]);

        assert_eq!(driver.battery_level().await.unwrap(), Some(87));
    }

    #[tokio::test]
    async fn test_battery_level_falls_back_to_standard_service() {
        let (transport, driver) = driver_for(DeviceType::MiBand8);
        transport.connect(Duration::from_secs(1)).await.unwrap();
        transport.set_read_value(bt_uuid(CHAR_BATTERY_LEVEL), vec![64]);

        assert_eq!(driver.battery_level().await.unwrap(), Some(64));
    }

    #[tokio::test]
    async fn test_device_info_read() {
        let (transport, driver) = driver_for(DeviceType::MiBand4);
        transport.connect(Duration::from_secs(1)).await.unwrap();
        let mut value = vec![2, 1, 9, 0, 1, 0];
        value.extend_from_slice(&[0x12; 10]);
        transport.set_read_value(bt_uuid(CHAR_AUTH), value);

        let info = driver.device_info().await.unwrap();
        assert_eq!(info.firmware_version.as_deref(), Some("2.1.9"));
        assert_eq!(info.hardware_version.as_deref(), Some("1.0"));
    }

    #[tokio::test]
    async fn test_telemetry_pump_dispatches_events() {
        let transport = Arc::new(MockTransport::new(ADDRESS, vec![]));
        let recorder = Arc::new(BandEventRecorder::default());
        let driver = MiBandDriver::new(DriverContext {
            transport: Arc::clone(&transport) as Arc<dyn Transport>,
            device_type: DeviceType::MiBand5,
            events: Arc::clone(&recorder) as Arc<dyn DeviceEvents>,
        });
        transport.connect(Duration::from_secs(1)).await.unwrap();
        driver.initialize().await.unwrap();

        transport.notify(bt_uuid(CHAR_HEART_RATE_DATA), vec![0x10, 72, 0x00]);
        transport.notify(
            bt_uuid(CHAR_ACTIVITY_DATA),
            vec![0x04, 0x0A, 0x00, 0x00, 0x05, 0x00],
        );
        transport.notify(bt_uuid(CHAR_REALTIME_STEPS), vec![0x06, 0x39, 0x05, 0x00]);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(recorder.heart_rates(), vec![72]);
        // Steps arrive on two channels, so the order is not guaranteed.
        let mut steps = recorder.steps();
        steps.sort_unstable();
        assert_eq!(steps, vec![10, 1337]);
        assert_eq!(recorder.calories(), vec![5]);

        driver.shutdown().await;
    }

    #[tokio::test]
    async fn test_pump_ignores_garbage() {
        let transport = Arc::new(MockTransport::new(ADDRESS, vec![]));
        let recorder = Arc::new(BandEventRecorder::default());
        let driver = MiBandDriver::new(DriverContext {
            transport: Arc::clone(&transport) as Arc<dyn Transport>,
            device_type: DeviceType::MiBand5,
            events: Arc::clone(&recorder) as Arc<dyn DeviceEvents>,
        });
        transport.connect(Duration::from_secs(1)).await.unwrap();
        driver.initialize().await.unwrap();

        transport.notify(bt_uuid(CHAR_ACTIVITY_DATA), vec![0xFF]);
        transport.notify(bt_uuid(CHAR_HEART_RATE_DATA), vec![]);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(recorder.heart_rates().is_empty());
        assert!(recorder.steps().is_empty());

        driver.shutdown().await;
    }

    #[tokio::test]
    async fn test_registry_builds_driver_for_every_generation() {
        let registry = DriverRegistry::default();
        for device_type in DeviceType::ALL {
            let transport = Arc::new(MockTransport::new(ADDRESS, vec![]));
            let driver = registry
                .create(DriverContext {
                    transport,
                    device_type,
                    events: Arc::new(crate::types::NoopEvents),
                })
                .unwrap();
            assert_eq!(driver.device_type(), device_type);
        }
    }

    #[tokio::test]
    async fn test_registry_rejects_unknown() {
        let registry = DriverRegistry::default();
        let transport = Arc::new(MockTransport::new(ADDRESS, vec![]));
        let err = registry
            .create(DriverContext {
                transport,
                device_type: DeviceType::Unknown,
                events: Arc::new(crate::types::NoopEvents),
            })
            .unwrap_err();
        assert!(matches!(err, BandError::DeviceNotSupported { .. }));
    }
}
