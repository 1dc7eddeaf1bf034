//! BLE Wi-Fi provisioning over BlueZ.
//!
//! The service exports a GATT application on the system bus (an identity
//! service with DSN and DUID characteristics, a Wi-Fi configuration service
//! with connect, state, scan and result characteristics, and a setup-token
//! service), registers an LE advertisement named after the adapter address,
//! and forwards everything a provisioning peer writes to the platform's
//! Wi-Fi subsystem through the [`wifi::WifiControl`] trait.
//!
//! Bring-up is a timeout-driven state machine ([`service::BringUp`]) that
//! powers the adapter, registers a NoInputNoOutput pairing agent, learns
//! the adapter address, subscribes to object and property signals, and then
//! waits for the provisioning window to open before exporting the GATT
//! tree and advertisement. Each step retries at a fixed cadence until its
//! broker call succeeds; nothing ever skips a step.
//!
//! Everything runs on a single [`ayla_reactor::Reactor`] thread.

pub mod bluez;
pub mod broker;
mod hci;
pub mod objects;
pub mod payload;
pub mod service;
pub mod wifi;

pub use crate::broker::Broker;
pub use crate::service::{BringUp, Config, GattError, GattService};
