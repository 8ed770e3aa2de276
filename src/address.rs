//! Hardware address of the target scale.
//!
//! The scale is selected purely by its Bluetooth address. Addresses are kept
//! as six raw bytes so that `aa:bb:..` and `AA:BB:..` name the same device,
//! and are always displayed in upper-case colon form.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Bluetooth hardware address of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DeviceAddress(pub [u8; 6]);

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

/// Errors returned when parsing an address string.
#[derive(Error, Debug, PartialEq)]
pub enum ParseAddressError {
    #[error("invalid device address: expected 6 octets, got {0}")]
    OctetCount(usize),
    #[error("invalid device address: '{0}' is not a hex octet")]
    Octet(String),
}

impl FromStr for DeviceAddress {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let octets: Vec<&str> = s.trim().split(':').collect();
        if octets.len() != 6 {
            return Err(ParseAddressError::OctetCount(octets.len()));
        }

        let mut bytes = [0u8; 6];
        for (slot, octet) in bytes.iter_mut().zip(&octets) {
            if octet.len() != 2 {
                return Err(ParseAddressError::Octet(octet.to_string()));
            }
            *slot = u8::from_str_radix(octet, 16)
                .map_err(|_| ParseAddressError::Octet(octet.to_string()))?;
        }

        Ok(DeviceAddress(bytes))
    }
}

#[cfg(feature = "bluer")]
impl From<bluer::Address> for DeviceAddress {
    fn from(addr: bluer::Address) -> Self {
        Self(addr.0)
    }
}

#[cfg(feature = "bluer")]
impl From<DeviceAddress> for bluer::Address {
    fn from(addr: DeviceAddress) -> Self {
        bluer::Address(addr.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_displays_upper_case() {
        let addr: DeviceAddress = "c4:7c:8d:6a:01:ff".parse().unwrap();
        assert_eq!(addr.to_string(), "C4:7C:8D:6A:01:FF");
    }

    #[test]
    fn test_parsing_ignores_case() {
        let addr = DeviceAddress([0xC4, 0x7C, 0x8D, 0x6A, 0x01, 0xFF]);
        assert_eq!("C4:7C:8D:6A:01:FF".parse::<DeviceAddress>(), Ok(addr));
        assert_eq!("c4:7c:8d:6a:01:ff".parse::<DeviceAddress>(), Ok(addr));
        assert_ne!("C4:7C:8D:6A:01:FE".parse::<DeviceAddress>(), Ok(addr));
    }

    #[test]
    fn test_rejects_malformed_addresses() {
        assert_eq!(
            "AA:BB:CC".parse::<DeviceAddress>(),
            Err(ParseAddressError::OctetCount(3))
        );
        assert_eq!(
            "AA:BB:CC:DD:EE:GG".parse::<DeviceAddress>(),
            Err(ParseAddressError::Octet("GG".to_string()))
        );
        assert_eq!(
            "AA:BB:CC:DD:EE:F".parse::<DeviceAddress>(),
            Err(ParseAddressError::Octet("F".to_string()))
        );
    }
}
