//! Bluetooth device addresses and their D-Bus object path encoding.
//!
//! BlueZ exports every remote device below its adapter as `dev_XX_XX_XX_XX_XX_XX`, where the
//! segment is derived from the colon-separated hardware address.

use crate::{Error, Result};

const DEVICE_PREFIX: &str = "dev_";

/// Describes the meaning of the bytes in a hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum AddressType {
    /// Address follows the MAC address standard.
    ///
    /// The first 3 Bytes identify the vendor, the last 3 Bytes identify the device.
    Public,
    /// Address is randomly generated.
    ///
    /// These addresses can either be "Static Random" addresses, or they can be resolvable or
    /// non-resolvable "Private Random" addresses for use with BLE Privacy.
    Random,
}

impl AddressType {
    pub(crate) fn from_str(s: &str) -> Result<Self> {
        match s {
            "public" => Ok(Self::Public),
            "random" => Ok(Self::Random),
            _ => Err(Error::from(format!("invalid address type '{}'", s))),
        }
    }
}

/// Turns a hardware address like `aa:bb:cc:dd:ee:ff` into the object path segment BlueZ uses for
/// the device (`dev_AA_BB_CC_DD_EE_FF`).
///
/// The input is accepted in any letter case.
pub fn encode_device_id(address: &str) -> String {
    format!(
        "{}{}",
        DEVICE_PREFIX,
        address.replace(':', "_").to_uppercase()
    )
}

/// Reverses [`encode_device_id`], turning `dev_AA_BB_CC_DD_EE_FF` back into `AA:BB:CC:DD:EE:FF`.
pub fn decode_device_id(id: &str) -> String {
    id.get(DEVICE_PREFIX.len()..)
        .unwrap_or_default()
        .replace('_', ":")
}
