//! Wi-Fi station settings.
//!
//! Persists the network name and passphrase in the `wifi` NVS namespace
//! and, on ESP-IDF, brings the station interface up with them before the
//! broker connection is attempted.
//!
//! ## cfg gating
//!
//! - **`target_os = "espidf"`**: [`start_station`] drives `esp_idf_svc::wifi`.
//! - **all other targets**: settings persistence only.

use core::fmt;

use log::info;

use crate::app::ports::{StorageError, StoragePort};

pub const NAMESPACE: &str = "wifi";
const KEY_SSID: &str = "ssid";
const KEY_PASSPHRASE: &str = "passphrase";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiError {
    NotConfigured,
    InvalidSsid,
    InvalidPassphrase,
    Storage(StorageError),
    ConnectionFailed,
}

impl fmt::Display for WifiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConfigured => write!(f, "no Wi-Fi settings stored"),
            Self::InvalidSsid => write!(f, "SSID invalid (must be 1-32 printable ASCII bytes)"),
            Self::InvalidPassphrase => {
                write!(f, "passphrase invalid (must be 8-64 bytes for WPA2, or empty for open)")
            }
            Self::Storage(e) => write!(f, "storage: {e}"),
            Self::ConnectionFailed => write!(f, "Wi-Fi connection failed"),
        }
    }
}

impl From<StorageError> for WifiError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

// ───────────────────────────────────────────────────────────────
// Validation
// ───────────────────────────────────────────────────────────────

fn validate_ssid(ssid: &str) -> Result<(), WifiError> {
    let printable = ssid.bytes().all(|b| (0x20..=0x7E).contains(&b));
    if ssid.is_empty() || ssid.len() > 32 || !printable {
        return Err(WifiError::InvalidSsid);
    }
    Ok(())
}

fn validate_passphrase(passphrase: &str) -> Result<(), WifiError> {
    if !passphrase.is_empty() && !(8..=64).contains(&passphrase.len()) {
        return Err(WifiError::InvalidPassphrase);
    }
    Ok(())
}

// ───────────────────────────────────────────────────────────────
// Settings
// ───────────────────────────────────────────────────────────────

#[derive(Clone, PartialEq, Eq)]
pub struct WifiSettings {
    pub ssid: heapless::String<32>,
    pub passphrase: heapless::String<64>,
}

impl fmt::Debug for WifiSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WifiSettings")
            .field("ssid", &self.ssid.as_str())
            .field("open", &self.passphrase.is_empty())
            .finish()
    }
}

impl WifiSettings {
    pub fn new(ssid: &str, passphrase: &str) -> Result<Self, WifiError> {
        validate_ssid(ssid)?;
        validate_passphrase(passphrase)?;
        let mut s = Self {
            ssid: heapless::String::new(),
            passphrase: heapless::String::new(),
        };
        s.ssid.push_str(ssid).map_err(|()| WifiError::InvalidSsid)?;
        s.passphrase
            .push_str(passphrase)
            .map_err(|()| WifiError::InvalidPassphrase)?;
        Ok(s)
    }

    pub fn load(storage: &dyn StoragePort) -> Result<Self, WifiError> {
        let mut ssid = [0u8; 32];
        let ssid_len = match storage.read(NAMESPACE, KEY_SSID, &mut ssid) {
            Ok(n) => n,
            Err(StorageError::NotFound) => return Err(WifiError::NotConfigured),
            Err(e) => return Err(e.into()),
        };
        let mut pass = [0u8; 64];
        let pass_len = match storage.read(NAMESPACE, KEY_PASSPHRASE, &mut pass) {
            Ok(n) => n,
            Err(StorageError::NotFound) => 0,
            Err(e) => return Err(e.into()),
        };
        let ssid = core::str::from_utf8(&ssid[..ssid_len]).map_err(|_| WifiError::InvalidSsid)?;
        let pass =
            core::str::from_utf8(&pass[..pass_len]).map_err(|_| WifiError::InvalidPassphrase)?;
        Self::new(ssid, pass)
    }

    pub fn store(&self, storage: &mut dyn StoragePort) -> Result<(), WifiError> {
        storage.write(NAMESPACE, KEY_SSID, self.ssid.as_bytes())?;
        storage.write(NAMESPACE, KEY_PASSPHRASE, self.passphrase.as_bytes())?;
        info!("WiFi: settings stored (SSID='{}')", self.ssid);
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────
// Station bring-up
// ───────────────────────────────────────────────────────────────

#[cfg(target_os = "espidf")]
pub fn start_station(
    modem: esp_idf_hal::modem::Modem,
    sysloop: esp_idf_svc::eventloop::EspSystemEventLoop,
    settings: &WifiSettings,
) -> Result<esp_idf_svc::wifi::BlockingWifi<esp_idf_svc::wifi::EspWifi<'static>>, WifiError> {
    use esp_idf_svc::wifi::{AuthMethod, BlockingWifi, ClientConfiguration, Configuration, EspWifi};

    let esp_wifi =
        EspWifi::new(modem, sysloop.clone(), None).map_err(|_| WifiError::ConnectionFailed)?;
    let mut wifi =
        BlockingWifi::wrap(esp_wifi, sysloop).map_err(|_| WifiError::ConnectionFailed)?;

    let auth_method = if settings.passphrase.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPA2Personal
    };
    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: settings.ssid.clone(),
        password: settings.passphrase.clone(),
        auth_method,
        ..Default::default()
    }))
    .map_err(|_| WifiError::ConnectionFailed)?;

    wifi.start().map_err(|_| WifiError::ConnectionFailed)?;
    wifi.connect().map_err(|_| WifiError::ConnectionFailed)?;
    wifi.wait_netif_up().map_err(|_| WifiError::ConnectionFailed)?;
    info!("WiFi: connected to '{}'", settings.ssid);
    Ok(wifi)
}

// ───────────────────────────────────────────────────────────────
// Tests
// ───────────────────────────────────────────────────────────────
