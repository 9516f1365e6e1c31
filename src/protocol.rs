use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{BufMut, BytesMut};
use uuid::Uuid;

use crate::{
    codec,
    types::{
        ActivityData, ActivityKind, DetailedActivityData, DeviceInfo, HeartRateQuality,
        HeartRateSample,
    },
};

/// Maximum outbound packet size, matching the default BLE write size
pub const MAX_PACKET_SIZE: usize = 20;

/// Authentication frame size: 2-byte opcode plus 16-byte body
pub const AUTH_PACKET_SIZE: usize = 18;

/// Base UUID shared by all 16-bit Bluetooth SIG identifiers
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_00805F_9B34FB;

/// Primary Mi Band service
pub const SERVICE_MIBAND: u16 = 0xFEE0;
/// Secondary Mi Band service (auth lives here on newer models)
pub const SERVICE_MIBAND2: u16 = 0xFEE1;
/// Standard heart-rate service
pub const SERVICE_HEART_RATE: u16 = 0x180D;
/// Standard device-information service
pub const SERVICE_DEVICE_INFO: u16 = 0x180A;
/// Standard battery service
pub const SERVICE_BATTERY: u16 = 0x180F;
/// Generic access service, probed for the device name
pub const SERVICE_GENERIC_ACCESS: u16 = 0x1800;
/// HID service, advertised by gen-8 bands
pub const SERVICE_HID: u16 = 0x1812;

/// Authentication characteristic
pub const CHAR_AUTH: u16 = 0xFF01;
/// Heart-rate control point (measurement trigger)
pub const CHAR_HEART_RATE_CONTROL: u16 = 0x2A39;
/// Heart-rate measurement notifications
pub const CHAR_HEART_RATE_DATA: u16 = 0x2A37;
/// Realtime step notifications
pub const CHAR_REALTIME_STEPS: u16 = 0xFF06;
/// Activity data notifications
pub const CHAR_ACTIVITY_DATA: u16 = 0xFF04;
/// Notification push characteristic
pub const CHAR_NOTIFICATION: u16 = 0xFF03;
/// Vendor battery characteristic
pub const CHAR_BATTERY: u16 = 0xFF0C;
/// Time characteristic
pub const CHAR_TIME: u16 = 0xFF0A;
/// Standard GAP device-name characteristic, read during probing
pub const CHAR_DEVICE_NAME: u16 = 0x2A00;
/// Standard battery-level characteristic
pub const CHAR_BATTERY_LEVEL: u16 = 0x2A19;

/// Leading type byte of a heart-rate telemetry packet
pub const RESPONSE_HEART_RATE: u8 = 0x10;
/// Leading type byte of an activity telemetry packet
pub const RESPONSE_ACTIVITY: u8 = 0x04;
/// Leading type byte of a realtime-steps telemetry packet
pub const RESPONSE_REALTIME_STEPS: u8 = 0x06;

/// Expand a 16-bit Bluetooth SIG identifier to a full UUID
#[must_use]
pub const fn bt_uuid(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Extract the 16-bit identifier from a SIG base UUID, if it is one
#[must_use]
pub const fn short_uuid(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    const MASK: u128 = !(0xFFFF_u128 << 96);
    if value & MASK == BLUETOOTH_BASE_UUID {
        Some(((value >> 96) & 0xFFFF) as u16)
    } else {
        None
    }
}

/// Start a manual heart-rate measurement
#[must_use]
pub const fn start_heart_rate_command() -> [u8; 3] {
    [0x15, 0x01, 0x01]
}

/// Stop a manual heart-rate measurement
#[must_use]
pub const fn stop_heart_rate_command() -> [u8; 3] {
    [0x15, 0x01, 0x00]
}

/// Enable realtime step notifications
#[must_use]
pub const fn start_realtime_steps_command() -> [u8; 3] {
    [0x15, 0x00, 0x01]
}

/// Disable realtime step notifications
#[must_use]
pub const fn stop_realtime_steps_command() -> [u8; 3] {
    [0x15, 0x00, 0x00]
}

/// Request stored activity data
#[must_use]
pub const fn fetch_activity_command() -> [u8; 2] {
    [0x01, 0x01]
}

/// Trigger the find-device vibration
#[must_use]
pub const fn find_device_command() -> [u8; 2] {
    [0x08, 0x01]
}

/// Set the device clock to a unix timestamp
#[must_use]
pub fn set_time_command(unix_seconds: u32) -> [u8; 5] {
    let mut command = [0u8; 5];
    command[0] = 0x0A;
    command[1..5].copy_from_slice(&codec::u32_to_le_bytes(unix_seconds));
    command
}

/// Set the device clock to now
#[must_use]
pub fn set_time_now_command() -> [u8; 5] {
    let unix_seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs();
    set_time_command(u32::try_from(unix_seconds).unwrap_or(u32::MAX))
}

/// Push a text notification to the device display
///
/// The message is truncated so the whole packet fits the 20-byte write size.
#[must_use]
pub fn notification_command(message: &str) -> Vec<u8> {
    let mut text: &str = message;
    while text.len() > MAX_PACKET_SIZE - 2 {
        let mut cut = text.len() - 1;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text = &text[..cut];
    }

    let mut command = BytesMut::with_capacity(2 + text.len());
    command.put_u8(0x05);
    command.put_u8(text.len() as u8);
    command.put_slice(text.as_bytes());
    command.to_vec()
}

/// Decode a basic activity or realtime-steps packet
///
/// Returns `None` for packets shorter than 4 bytes or with an unrecognized
/// type byte. Field offsets are fixed by the vendor protocol: steps as a
/// little-endian u24 at offset 1, calories as a u16 at offset 4, distance as
/// a u32 at offset 6.
#[must_use]
pub fn parse_activity(data: &[u8]) -> Option<ActivityData> {
    if data.len() < 4 {
        return None;
    }

    match data[0] {
        RESPONSE_ACTIVITY => {
            let mut activity = ActivityData {
                steps: Some(codec::read_u24_le(data, 1)),
                ..ActivityData::default()
            };
            if data.len() >= 6 {
                activity.calories = Some(codec::read_u16_le(data, 4));
            }
            if data.len() >= 10 {
                activity.distance = Some(codec::read_u32_le(data, 6));
            }
            Some(activity)
        }
        RESPONSE_REALTIME_STEPS => Some(ActivityData {
            steps: Some(codec::read_u24_le(data, 1)),
            ..ActivityData::default()
        }),
        _ => None,
    }
}

/// Decode a detailed activity packet (category 0x01 realtime, 0x02 historical)
#[must_use]
pub fn parse_detailed_activity(data: &[u8]) -> Option<DetailedActivityData> {
    if data.len() < 8 {
        return None;
    }

    match data[0] {
        0x01 => Some(DetailedActivityData {
            steps: codec::read_u32_le(data, 1),
            calories: codec::read_u16_le(data, 5),
            distance: codec::read_u16_le(data, 7),
            active_minutes: codec::read_u16_le(data, 9),
            timestamp: SystemTime::now(),
            kind: ActivityKind::Realtime,
        }),
        0x02 => {
            let unix_seconds = codec::read_u32_le(data, 1);
            Some(DetailedActivityData {
                steps: codec::read_u32_le(data, 5),
                calories: codec::read_u16_le(data, 9),
                distance: codec::read_u16_le(data, 11),
                active_minutes: codec::read_u16_le(data, 13),
                timestamp: UNIX_EPOCH + Duration::from_secs(u64::from(unix_seconds)),
                kind: ActivityKind::Historical,
            })
        }
        _ => None,
    }
}

/// Decode a vendor heart-rate packet
///
/// The rate sits in the second byte; a third byte, when present, carries
/// contact quality. Packets without the heart-rate type byte yield `None`.
#[must_use]
pub fn parse_heart_rate(data: &[u8]) -> Option<HeartRateSample> {
    if data.len() < 2 || data[0] != RESPONSE_HEART_RATE {
        return None;
    }

    let quality = match data.get(2) {
        Some(0x00) => HeartRateQuality::Good,
        Some(0x01) => HeartRateQuality::Poor,
        _ => HeartRateQuality::Unknown,
    };

    Some(HeartRateSample {
        heart_rate: data[1],
        quality,
    })
}

/// Decode a battery packet into a percentage
///
/// Returns `None` for packets shorter than 2 bytes; otherwise the value is
/// clamped to `[0, 100]`. Never fails.
#[must_use]
pub fn parse_battery_level(data: &[u8]) -> Option<u8> {
    if data.len() < 2 {
        return None;
    }
    Some(data[1].min(100))
}

/// Decode a device-info packet
///
/// Firmware version comes from bytes 0..3, hardware version from bytes 4..6,
/// and the serial number is the hex of bytes 6..16; each field is present
/// only when the packet is long enough to carry it.
#[must_use]
pub fn parse_device_info(data: &[u8]) -> DeviceInfo {
    let mut info = DeviceInfo::default();

    if data.len() >= 4 {
        info.firmware_version = Some(format!("{}.{}.{}", data[0], data[1], data[2]));
    }
    if data.len() >= 6 {
        info.hardware_version = Some(format!("{}.{}", data[4], data[5]));
    }
    if data.len() >= 16 {
        info.serial_number = Some(codec::bytes_to_hex(&data[6..16]));
    }

    info
}

/// Acknowledgement for a pushed notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationAck {
    /// Whether the device accepted the notification
    pub success: bool,
    /// Message id echoed back, when present
    pub message_id: Option<u8>,
}

/// Decode a notification acknowledgement packet
#[must_use]
pub fn parse_notification_ack(data: &[u8]) -> Option<NotificationAck> {
    if data.len() < 2 {
        return None;
    }
    Some(NotificationAck {
        success: data[1] == 0x01,
        message_id: data.get(2).copied(),
    })
}
