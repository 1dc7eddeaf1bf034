//! The interface to the Wi-Fi collaborator.
//!
//! The provisioning service never manages stations, credentials or DHCP
//! itself; it forwards the peer's requests to an implementation of
//! [`WifiControl`] and renders that implementation's state onto the GATT
//! characteristics. Callbacks registered through the `on_*` methods must be
//! invoked on the reactor thread.

/// Security mode of a network, as carried in the connect and scan-result
/// payloads.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Security {
    #[default]
    Open,
    Wep,
    Wpa,
    Wpa2Personal,
}

impl Security {
    pub fn wire_value(self) -> u8 {
        match self {
            Security::Open => 0,
            Security::Wep => 1,
            Security::Wpa => 2,
            Security::Wpa2Personal => 3,
        }
    }

    /// Unknown values fall back to open.
    pub fn from_wire(value: u8) -> Security {
        match value {
            1 => Security::Wep,
            2 => Security::Wpa,
            3 => Security::Wpa2Personal,
            _ => Security::Open,
        }
    }
}

/// Wi-Fi fault codes reported on the *state* characteristic.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(u8)]
pub enum WifiError {
    #[default]
    None = 0,
    /// Resource problem, possibly temporary.
    Mem = 1,
    /// Connection timed out.
    Time = 2,
    InvalidKey = 3,
    NotFound = 4,
    NotAuth = 5,
    WrongKey = 6,
    /// Failed to get an IP address from DHCP.
    NoIp = 7,
    /// Failed to get a default gateway from DHCP.
    NoRoute = 8,
    /// Failed to get a DNS server from DHCP.
    NoDns = 9,
    /// The AP disconnected us.
    ApDisconnected = 10,
    /// Loss of signal / beacon miss.
    SignalLost = 11,
    /// Device service host name lookup failed.
    ClientDns = 12,
    /// Device service GET redirected.
    ClientRedirect = 13,
    /// Device service connection timed out.
    ClientTimeout = 14,
    /// No empty profile slots.
    NoProfileSlots = 15,
    SecurityUnsupported = 16,
    /// Network type (e.g. ad-hoc) not supported.
    NetworkUnsupported = 17,
    /// Server incompatible. May be a hotspot.
    Protocol = 18,
    /// Failed to authenticate to the device service.
    ClientAuth = 19,
    /// Attempt still in progress.
    InProgress = 20,
}

impl WifiError {
    pub fn wire_value(self) -> u8 {
        self as u8
    }
}

/// The collaborator's view of the connection attempt, before it is mapped
/// onto the wire states of the *state* characteristic.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConnState {
    Disabled,
    /// Choosing a profile to try.
    Selecting,
    #[default]
    Idle,
    /// Associating with the AP.
    Joining,
    /// Waiting for DHCP to assign an address.
    Dhcp,
    /// Associated, waiting for the cloud client to come up.
    WaitingForCloud,
    Up,
    Failed,
}

/// A snapshot of the current (or most recent) connection attempt.
#[derive(Clone, Debug, Default)]
pub struct WifiStatus {
    pub ssid: Vec<u8>,
    pub error: WifiError,
    pub state: ConnState,
}

/// One scan result, in the collaborator's terms.
#[derive(Clone, Debug)]
pub struct ScanEntry {
    pub ssid: Vec<u8>,
    pub bssid: [u8; 6],
    pub rssi: i16,
    pub security: Security,
}

/// A connect request decoded from the *connect* characteristic.
#[derive(Clone, Debug)]
pub struct ConnectRequest {
    pub ssid: Vec<u8>,
    pub bssid: [u8; 6],
    pub key: Vec<u8>,
    pub security: Security,
}

/// The Wi-Fi subsystem the provisioning service drives.
pub trait WifiControl {
    /// The device serial number, if the platform knows it yet.
    fn dsn(&self) -> Option<String>;

    /// Kick off a fresh scan; completion is reported through the
    /// scan-complete callback.
    fn start_scan(&self);

    /// The most recent scan results, at most `limit` entries.
    fn scan_results(&self, limit: usize) -> Vec<ScanEntry>;

    /// Attempt to join the given network. Outcomes surface through
    /// connect-state-change callbacks and [`WifiControl::status`].
    fn connect(&self, request: &ConnectRequest);

    fn status(&self) -> WifiStatus;

    /// Record the setup token the provisioning peer handed us.
    fn set_setup_token(&self, token: &str);

    fn on_scan_complete(&self, callback: Box<dyn Fn()>);
    fn on_connect_state_change(&self, callback: Box<dyn Fn()>);
    /// AP-mode (setup window) changes; `true` while a provisioning window
    /// is open and the device should advertise.
    fn on_ap_mode_change(&self, callback: Box<dyn Fn(bool)>);
}
