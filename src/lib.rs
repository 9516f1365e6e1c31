#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Bandlers
//!
//! A Rust library for talking to Xiaomi Mi Band fitness trackers over
//! Bluetooth Low Energy.
//!
//! The library covers the whole pairing lifecycle: scanning and classifying
//! devices across eight Mi Band generations, the AES-128 challenge-response
//! authentication handshake used from gen 2 onwards, telemetry decoding
//! (heart rate, steps, calories, battery), and session supervision with
//! automatic reconnection.
//!
//! ## Protocol Notes
//!
//! The vendor protocol rides on two custom GATT services (`0xFEE0` and
//! `0xFEE1`) next to the standard heart-rate, battery and device-information
//! services:
//!
//! - **Authentication**: three-step exchange on characteristic `0xFF01` -
//!   push the 16-byte key, request a random challenge, return it encrypted
//!   with AES-128-ECB
//! - **Telemetry**: notification-driven packets with a leading type byte;
//!   multi-byte integers are little-endian, step counts are 24-bit
//! - **Commands**: short opcode frames, never larger than a 20-byte write
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//! use bandlers::{
//!     BandManager, DeviceScanner, DriverRegistry, NoopEvents, PairingOptions, Timeouts,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let scanner = DeviceScanner::new().await?;
//!     let candidates = scanner.scan(Duration::from_secs(10)).await?;
//!     let candidate = candidates.first().ok_or("no band in range")?;
//!
//!     let manager = BandManager::new(
//!         DriverRegistry::default(),
//!         Arc::new(NoopEvents),
//!         Timeouts::default(),
//!     );
//!     let options = PairingOptions {
//!         auth_key: Some("00112233445566778899aabbccddeeff".into()),
//!         ..PairingOptions::default()
//!     };
//!     let session = manager.pair_discovered(&scanner, candidate, &options).await?;
//!
//!     session.start_heart_rate().await?;
//!     println!("battery: {:?}", session.battery_level().await?);
//!     Ok(())
//! }
//! ```

/// Authentication handshake and key handling
pub mod auth;
/// Byte-level helpers shared by the protocol layers
pub mod codec;
/// Protocol drivers and the generation-to-driver registry
pub mod device;
/// Scanning, classification and active probing
pub mod discovery;
/// Error types and handling
pub mod error;
/// Wire protocol: UUIDs, command builders and packet parsers
pub mod protocol;
/// Session lifecycle and supervision
pub mod session;
/// Connection state machine and reconnect supervision
pub mod state;
/// GATT transport abstraction and the btleplug implementation
pub mod transport;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use auth::AuthKey;
pub use device::{DeviceDriver, DriverContext, DriverRegistry, MiBandDriver};
pub use discovery::{DeviceScanner, XIAOMI_COMPANY_ID};
pub use error::{BandError, Result};
pub use session::{BandManager, Session};
pub use state::{ConnectionState, StateMachine};
pub use transport::{BtleplugTransport, Transport};
pub use types::{
    Capabilities, DeviceCandidate, DeviceEvents, DeviceInfo, DeviceType, HealthMetrics,
    NoopEvents, PairingOptions, Timeouts,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
