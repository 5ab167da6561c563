use serde::{Deserialize, Serialize};
use std::fmt;

/// Guest operating system class. Drives boot method and a handful of
/// platform-only device decisions in Device Assembly (trackpad, Rosetta,
/// save/restore support).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestOs {
    Macos,
    Linux,
}

/// A 6-byte MAC address, rendered and parsed as lowercase colon-hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> [u8; 6] {
        self.0
    }

    /// Generates a locally-administered, unicast MAC address suitable for a
    /// virtio network device, following the same bit conventions as the rest
    /// of the toolset's MAC generation: multicast bit clear, local bit set.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 6];
        let random = uuid::Uuid::new_v4();
        bytes.copy_from_slice(&random.as_bytes()[0..6]);
        bytes[0] = (bytes[0] & 0xfe) | 0x02;
        Self(bytes)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl TryFrom<String> for MacAddress {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let parts: Vec<&str> = value.split(':').collect();
        if parts.len() != 6 {
            return Err(format!("invalid MAC address '{value}'"));
        }
        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            bytes[i] = u8::from_str_radix(part, 16)
                .map_err(|_| format!("invalid MAC address '{value}'"))?;
        }
        Ok(Self(bytes))
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.to_string()
    }
}
