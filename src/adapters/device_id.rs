//! Device identity derived from the factory MAC address.
//!
//! Before fleet provisioning assigns a thing name the device is known by
//! its MAC, formatted `aa:bb:cc:dd:ee:ff`.  The provisioning template
//! receives the same string as its `MacAddress` parameter.

pub type MacAddress = [u8; 6];

/// Read the factory MAC address from eFuse.
#[cfg(target_os = "espidf")]
pub fn read_mac() -> MacAddress {
    let mut mac: MacAddress = [0u8; 6];
    // SAFETY: the buffer is the 6 bytes the call writes.
    unsafe {
        esp_idf_svc::sys::esp_efuse_mac_get_default(mac.as_mut_ptr());
    }
    mac
}

/// Simulation: a fixed MAC.
#[cfg(not(target_os = "espidf"))]
pub fn read_mac() -> MacAddress {
    [0xDE, 0xAD, 0xBE, 0xEF, 0xCA, 0xFE]
}

pub fn mac_string(mac: &MacAddress) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_format() {
        assert_eq!(mac_string(&[0x00, 0x11, 0x22, 0xAA, 0xBB, 0xCC]), "00:11:22:aa:bb:cc");
    }

    #[cfg(not(target_os = "espidf"))]
    #[test]
    fn sim_mac_deterministic() {
        assert_eq!(mac_string(&read_mac()), "de:ad:be:ef:ca:fe");
    }
}
