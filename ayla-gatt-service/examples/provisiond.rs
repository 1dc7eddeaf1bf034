//! Demo provisioning daemon.
//!
//! Wires the GATT service to the system bus with an in-memory Wi-Fi
//! backend, so the BLE side can be exercised end to end from a phone
//! without a real Wi-Fi subsystem: scans return canned networks, connects
//! always progress to "up".
//!
//! Run as root (BlueZ policy) with `RUST_LOG=debug cargo run --example
//! provisiond`. Reads `provisiond.toml` from the working directory when
//! present.

use ayla_dbus_client::Client;
use ayla_gatt_service::wifi::{
    ConnState, ConnectRequest, ScanEntry, Security, WifiControl, WifiStatus,
};
use ayla_gatt_service::{Config, GattService};
use ayla_reactor::Reactor;
use eyre::WrapErr;
use log::info;
use std::cell::RefCell;
use std::rc::Rc;

/// Canned Wi-Fi backend: remembers what it is told and reports steady
/// progress, driving the service callbacks synchronously.
#[derive(Default)]
struct DemoWifi {
    scan_complete: RefCell<Option<Box<dyn Fn()>>>,
    state_change: RefCell<Option<Box<dyn Fn()>>>,
    ssid: RefCell<Vec<u8>>,
    state: RefCell<ConnState>,
}

impl DemoWifi {
    fn fire_scan_complete(&self) {
        if let Some(callback) = self.scan_complete.borrow().as_ref() {
            callback();
        }
    }

    fn fire_state_change(&self) {
        if let Some(callback) = self.state_change.borrow().as_ref() {
            callback();
        }
    }
}

impl WifiControl for DemoWifi {
    fn dsn(&self) -> Option<String> {
        Some("AC000W000000001".to_string())
    }

    fn start_scan(&self) {
        // A real subsystem scans asynchronously; canned results are ready
        // immediately.
        self.fire_scan_complete();
    }

    fn scan_results(&self, limit: usize) -> Vec<ScanEntry> {
        let canned = vec![
            ScanEntry {
                ssid: b"Home".to_vec(),
                bssid: [0x10, 0x20, 0x30, 0x40, 0x50, 0x60],
                rssi: -42,
                security: Security::Wpa2Personal,
            },
            ScanEntry {
                ssid: b"Guest".to_vec(),
                bssid: [0x10, 0x20, 0x30, 0x40, 0x50, 0x61],
                rssi: -70,
                security: Security::Open,
            },
        ];
        canned.into_iter().take(limit).collect()
    }

    fn connect(&self, request: &ConnectRequest) {
        info!(
            "connect requested: ssid {}",
            String::from_utf8_lossy(&request.ssid)
        );
        *self.ssid.borrow_mut() = request.ssid.clone();
        for state in [ConnState::Joining, ConnState::Dhcp, ConnState::Up] {
            *self.state.borrow_mut() = state;
            self.fire_state_change();
        }
    }

    fn status(&self) -> WifiStatus {
        WifiStatus {
            ssid: self.ssid.borrow().clone(),
            error: Default::default(),
            state: *self.state.borrow(),
        }
    }

    fn set_setup_token(&self, token: &str) {
        info!("setup token {:?}", token);
    }

    fn on_scan_complete(&self, callback: Box<dyn Fn()>) {
        *self.scan_complete.borrow_mut() = Some(callback);
    }

    fn on_connect_state_change(&self, callback: Box<dyn Fn()>) {
        *self.state_change.borrow_mut() = Some(callback);
    }

    fn on_ap_mode_change(&self, _callback: Box<dyn Fn(bool)>) {
        // The demo opens the provisioning window unconditionally at start.
    }
}

fn load_config() -> eyre::Result<Config> {
    match std::fs::read_to_string("provisiond.toml") {
        Ok(text) => toml::from_str(&text).wrap_err("parsing provisiond.toml"),
        Err(_) => Ok(Config::default()),
    }
}

fn main() -> eyre::Result<()> {
    pretty_env_logger::init();

    let config = load_config()?;
    let reactor = Rc::new(Reactor::new()?);
    let client = Client::connect(reactor.clone()).wrap_err("connecting to the system bus")?;
    let wifi = Rc::new(DemoWifi::default());

    let service = GattService::new(reactor.clone(), client.clone(), wifi, config);
    service.start();
    // No AP-mode source in the demo: open the provisioning window now.
    service.set_advertising(true);

    info!("provisioning service running");
    reactor.run()?;
    Ok(())
}
