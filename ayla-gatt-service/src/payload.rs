//! Packed characteristic payloads.
//!
//! Values cross the GATT boundary as fixed-length, zero-initialised byte
//! records. Fields narrower than their buffer (the SSID, the key) carry a
//! parallel length byte. Every multi-byte scalar is little-endian except the
//! scan-result RSSI, which is transmitted in network byte order.

pub const SSID_LEN: usize = 32;
pub const BSSID_LEN: usize = 6;
pub const KEY_LEN: usize = 64;
pub const DSN_LEN: usize = 15;
pub const ADDR_LEN: usize = 17;
pub const SETUP_TOKEN_LEN: usize = 8;
/// Most scan entries a result set can carry.
pub const SCAN_LIMIT: usize = 50;

pub const CONNECT_LEN: usize = SSID_LEN + 1 + BSSID_LEN + KEY_LEN + 1 + 1;
pub const STATUS_LEN: usize = SSID_LEN + 1 + 1 + 1;
pub const SCAN_RESULT_LEN: usize = 1 + SSID_LEN + 1 + BSSID_LEN + 2 + 1;

/// Wi-Fi connection state as reported on the *state* characteristic.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum LinkState {
    None = 0,
    Disabled = 1,
    ConnectingWifi = 2,
    ConnectingNet = 3,
    ConnectingCloud = 4,
    Up = 5,
}

/// A write to the *connect* characteristic.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConnectPayload {
    pub ssid: [u8; SSID_LEN],
    pub ssid_len: u8,
    pub bssid: [u8; BSSID_LEN],
    pub key: [u8; KEY_LEN],
    pub key_len: u8,
    /// 0 open, 1 WEP, 2 WPA, 3 WPA2-personal.
    pub security: u8,
}

impl Default for ConnectPayload {
    fn default() -> ConnectPayload {
        ConnectPayload {
            ssid: [0; SSID_LEN],
            ssid_len: 0,
            bssid: [0; BSSID_LEN],
            key: [0; KEY_LEN],
            key_len: 0,
            security: 0,
        }
    }
}

impl ConnectPayload {
    /// Parse a write. Short writes are zero-filled; over-length writes are
    /// rejected outright so no state changes.
    pub fn decode(bytes: &[u8]) -> Option<ConnectPayload> {
        if bytes.len() > CONNECT_LEN {
            return None;
        }
        let mut buf = [0u8; CONNECT_LEN];
        buf[..bytes.len()].copy_from_slice(bytes);

        let mut payload = ConnectPayload::default();
        payload.ssid.copy_from_slice(&buf[0..32]);
        payload.ssid_len = buf[32];
        payload.bssid.copy_from_slice(&buf[33..39]);
        payload.key.copy_from_slice(&buf[39..103]);
        payload.key_len = buf[103];
        payload.security = buf[104];
        Some(payload)
    }

    pub fn encode(&self) -> [u8; CONNECT_LEN] {
        let mut buf = [0u8; CONNECT_LEN];
        buf[0..32].copy_from_slice(&self.ssid);
        buf[32] = self.ssid_len;
        buf[33..39].copy_from_slice(&self.bssid);
        buf[39..103].copy_from_slice(&self.key);
        buf[103] = self.key_len;
        buf[104] = self.security;
        buf
    }

    /// The SSID bytes actually written, bounded by the length field.
    pub fn ssid(&self) -> &[u8] {
        &self.ssid[..usize::from(self.ssid_len).min(SSID_LEN)]
    }

    /// The key bytes actually written, bounded by the length field.
    pub fn key(&self) -> &[u8] {
        &self.key[..usize::from(self.key_len).min(KEY_LEN)]
    }
}

/// The *state* characteristic value.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StatusPayload {
    pub ssid: [u8; SSID_LEN],
    pub ssid_len: u8,
    pub error: u8,
    pub state: u8,
}

impl StatusPayload {
    pub fn encode(&self) -> [u8; STATUS_LEN] {
        let mut buf = [0u8; STATUS_LEN];
        buf[0..32].copy_from_slice(&self.ssid);
        buf[32] = self.ssid_len;
        buf[33] = self.error;
        buf[34] = self.state;
        buf
    }
}

/// One entry of the *result* characteristic stream. The all-zero record is
/// the stream terminator.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ScanResultPayload {
    pub index: u8,
    pub ssid: [u8; SSID_LEN],
    pub ssid_len: u8,
    pub bssid: [u8; BSSID_LEN],
    pub rssi: i16,
    /// 0 open, 1 WEP, 2 WPA, 3 WPA2-personal.
    pub security: u8,
}

impl ScanResultPayload {
    /// RSSI goes out in network byte order.
    pub fn encode(&self) -> [u8; SCAN_RESULT_LEN] {
        let mut buf = [0u8; SCAN_RESULT_LEN];
        buf[0] = self.index;
        buf[1..33].copy_from_slice(&self.ssid);
        buf[33] = self.ssid_len;
        buf[34..40].copy_from_slice(&self.bssid);
        buf[40..42].copy_from_slice(&self.rssi.to_be_bytes());
        buf[42] = self.security;
        buf
    }

    pub fn decode(bytes: &[u8]) -> Option<ScanResultPayload> {
        if bytes.len() != SCAN_RESULT_LEN {
            return None;
        }
        let mut payload = ScanResultPayload::default();
        payload.index = bytes[0];
        payload.ssid.copy_from_slice(&bytes[1..33]);
        payload.ssid_len = bytes[33];
        payload.bssid.copy_from_slice(&bytes[34..40]);
        payload.rssi = i16::from_be_bytes([bytes[40], bytes[41]]);
        payload.security = bytes[42];
        Some(payload)
    }
}
