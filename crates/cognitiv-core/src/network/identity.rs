use core::fmt::{self, Write};

use heapless::String;

/// Prefix of every MQTT client identifier this node uses.
pub const CLIENT_ID_PREFIX: &str = "cognitiv_";

/// "cognitiv_" (9) + 12 hex digits.
pub const CLIENT_ID_LEN: usize = 21;

pub type ClientId = String<CLIENT_ID_LEN>;

/// Radio hardware address.
///
/// Displays as `AA:BB:CC:DD:EE:FF`, the form carried in published payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Upper-case hex without separators.
    pub fn compact(&self) -> Compact<'_> {
        Compact(self)
    }

    pub fn client_id(&self) -> Result<ClientId, fmt::Error> {
        let mut id = ClientId::new();
        write!(id, "{}{}", CLIENT_ID_PREFIX, self.compact())?;
        Ok(id)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_char(':')?;
            }
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

pub struct Compact<'a>(&'a MacAddress);

impl fmt::Display for Compact<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.0.iter().try_for_each(|byte| write!(f, "{:02X}", byte))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: MacAddress = MacAddress([0x5C, 0xCF, 0x7F, 0x0a, 0x1b, 0x02]);

    #[test]
    fn test_mac_display() {
        let mut s: String<17> = String::new();
        write!(s, "{}", MAC).unwrap();
        assert_eq!(s.as_str(), "5C:CF:7F:0A:1B:02");
    }

    #[test]
    fn test_client_id_strips_separators() {
        let id = MAC.client_id().unwrap();
        assert_eq!(id.as_str(), "cognitiv_5CCF7F0A1B02");
        assert_eq!(id.len(), CLIENT_ID_LEN);
    }
}
