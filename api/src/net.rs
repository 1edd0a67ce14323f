use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use std::{
    fmt::{self, Display, Formatter},
    net::Ipv4Addr,
    str::FromStr,
};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetError {
    #[error("invalid MAC address {0:?}, expected six hex bytes separated by `:`")]
    InvalidMac(String),

    #[error("invalid subnet {0:?}, expected `a.b.c.d/prefix`")]
    InvalidSubnet(String),

    #[error("guest address {guest} is outside tap subnet {subnet}")]
    GuestOutsideSubnet { guest: Ipv4Addr, subnet: TapSubnet },

    #[error("guest address {guest} collides with the tap device address")]
    GuestIsHost { guest: Ipv4Addr },
}

/// Guest MAC address. The guest derives its IPv4 address from the last
/// four bytes, so the MAC also fixes where the guest can be reached.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct GuestMac([u8; 6]);

impl GuestMac {
    /// Leading bytes used when building a MAC for an address. The guest
    /// ignores them.
    pub const PREFIX: [u8; 2] = [0x06, 0x00];

    pub fn for_guest_ip(ip: Ipv4Addr) -> Self {
        let [a, b, c, d] = ip.octets();
        Self([Self::PREFIX[0], Self::PREFIX[1], a, b, c, d])
    }

    pub fn guest_ip(&self) -> Ipv4Addr {
        let [_, _, a, b, c, d] = self.0;
        Ipv4Addr::new(a, b, c, d)
    }
}

impl Display for GuestMac {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl FromStr for GuestMac {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || NetError::InvalidMac(s.to_owned());
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(bytes))
    }
}

impl Serialize for GuestMac {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GuestMac {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Address of the host side of a tap device, with its prefix length.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TapSubnet {
    host_ip: Ipv4Addr,
    prefix_len: u8,
}

impl TapSubnet {
    pub fn new(host_ip: Ipv4Addr, prefix_len: u8) -> Result<Self, NetError> {
        if prefix_len > 32 {
            return Err(NetError::InvalidSubnet(format!("{host_ip}/{prefix_len}")));
        }
        Ok(Self {
            host_ip,
            prefix_len,
        })
    }

    pub fn host_ip(&self) -> Ipv4Addr {
        self.host_ip
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    fn mask(&self) -> u32 {
        match self.prefix_len {
            0 => 0,
            len => u32::MAX << (32 - u32::from(len)),
        }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = self.mask();
        u32::from(ip) & mask == u32::from(self.host_ip) & mask
    }

    /// The guest must share the subnet with the tap device without taking
    /// its address, or SSH into the guest cannot work.
    pub fn check_guest(&self, guest: Ipv4Addr) -> Result<(), NetError> {
        if guest == self.host_ip {
            return Err(NetError::GuestIsHost { guest });
        }
        if !self.contains(guest) {
            return Err(NetError::GuestOutsideSubnet {
                guest,
                subnet: *self,
            });
        }
        Ok(())
    }
}

impl Display for TapSubnet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.host_ip, self.prefix_len)
    }
}

impl FromStr for TapSubnet {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || NetError::InvalidSubnet(s.to_owned());
        let (ip, prefix_len) = s.split_once('/').ok_or_else(invalid)?;
        let host_ip = ip.parse().map_err(|_| invalid())?;
        let prefix_len = prefix_len.parse().map_err(|_| invalid())?;
        Self::new(host_ip, prefix_len).map_err(|_| invalid())
    }
}

impl<'de> Deserialize<'de> for TapSubnet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_encodes_guest_ip() {
        let mac: GuestMac = "06:00:C0:A8:F1:02".parse().unwrap();
        assert_eq!(mac.guest_ip(), Ipv4Addr::new(192, 168, 241, 2));
        assert_eq!(
            GuestMac::for_guest_ip(Ipv4Addr::new(192, 168, 241, 2)),
            mac
        );
    }

    #[test]
    fn mac_prefix_is_ignored_for_ip() {
        let mac: GuestMac = "AA:BB:0A:00:00:05".parse().unwrap();
        assert_eq!(mac.guest_ip(), Ipv4Addr::new(10, 0, 0, 5));
    }

    #[test]
    fn mac_accepts_lowercase_and_displays_uppercase() {
        let mac: GuestMac = "06:00:c0:a8:f1:0a".parse().unwrap();
        assert_eq!(mac.to_string(), "06:00:C0:A8:F1:0A");
    }

    #[test]
    fn mac_rejects_bad_shapes() {
        for bad in ["", "06:00:C0:A8:F1", "06:00:C0:A8:F1:02:03", "06:00:C0:A8:F1:ZZ", "6:0:C0:A8:F1:02"] {
            assert_eq!(bad.parse::<GuestMac>(), Err(NetError::InvalidMac(bad.to_owned())));
        }
    }

    #[test]
    fn subnet_parses_cidr() {
        let subnet: TapSubnet = "192.168.241.1/30".parse().unwrap();
        assert_eq!(subnet.host_ip(), Ipv4Addr::new(192, 168, 241, 1));
        assert_eq!(subnet.prefix_len(), 30);
        assert_eq!(subnet.to_string(), "192.168.241.1/30");
        assert!("192.168.241.1".parse::<TapSubnet>().is_err());
        assert!("192.168.241.1/33".parse::<TapSubnet>().is_err());
    }

    #[test]
    fn guest_must_share_subnet() {
        let subnet: TapSubnet = "192.168.241.1/30".parse().unwrap();
        subnet.check_guest(Ipv4Addr::new(192, 168, 241, 2)).unwrap();
        assert_eq!(
            subnet.check_guest(Ipv4Addr::new(192, 168, 241, 6)),
            Err(NetError::GuestOutsideSubnet {
                guest: Ipv4Addr::new(192, 168, 241, 6),
                subnet,
            })
        );
        assert_eq!(
            subnet.check_guest(Ipv4Addr::new(192, 168, 241, 1)),
            Err(NetError::GuestIsHost {
                guest: Ipv4Addr::new(192, 168, 241, 1)
            })
        );
    }

    #[test]
    fn zero_prefix_contains_everything() {
        let subnet = TapSubnet::new(Ipv4Addr::new(10, 0, 0, 1), 0).unwrap();
        assert!(subnet.contains(Ipv4Addr::new(8, 8, 8, 8)));
    }
}
