use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tl_proto::{TlError, TlPacket, TlRead, TlResult, TlWrite};

/// A peer listen address.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Address(SocketAddr);

impl Address {
    pub fn as_socket_addr(&self) -> &SocketAddr {
        &self.0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for Address {
    type Err = std::net::AddrParseError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SocketAddr::from_str(s).map(Self)
    }
}

impl From<SocketAddr> for Address {
    #[inline]
    fn from(value: SocketAddr) -> Self {
        Self(value)
    }
}

impl From<SocketAddrV4> for Address {
    #[inline]
    fn from(value: SocketAddrV4) -> Self {
        Self(SocketAddr::V4(value))
    }
}

impl From<SocketAddrV6> for Address {
    #[inline]
    fn from(value: SocketAddrV6) -> Self {
        Self(SocketAddr::V6(value))
    }
}

impl From<(std::net::Ipv4Addr, u16)> for Address {
    #[inline]
    fn from((ip, port): (std::net::Ipv4Addr, u16)) -> Self {
        Self(SocketAddr::V4(SocketAddrV4::new(ip, port)))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.collect_str(&self.0)
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        if deserializer.is_human_readable() {
            let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
            s.parse().map_err(Error::custom)
        } else {
            SocketAddr::deserialize(deserializer).map(Self)
        }
    }
}

impl TlWrite for Address {
    type Repr = tl_proto::Boxed;

    fn max_size_hint(&self) -> usize {
        4 + match &self.0 {
            SocketAddr::V4(_) => 4 + 4,
            SocketAddr::V6(_) => 16 + 4,
        }
    }

    fn write_to<P: TlPacket>(&self, packet: &mut P) {
        match &self.0 {
            SocketAddr::V4(addr) => {
                packet.write_u32(ADDRESS_V4_TL_ID);
                packet.write_u32(u32::from(*addr.ip()));
                packet.write_u32(addr.port() as u32);
            }
            SocketAddr::V6(addr) => {
                packet.write_u32(ADDRESS_V6_TL_ID);
                packet.write_raw_slice(&addr.ip().octets());
                packet.write_u32(addr.port() as u32);
            }
        }
    }
}

impl<'tl> TlRead<'tl> for Address {
    type Repr = tl_proto::Boxed;

    fn read_from(packet: &mut &'tl [u8]) -> TlResult<Self> {
        Ok(Address(match u32::read_from(packet)? {
            ADDRESS_V4_TL_ID => {
                let ip = u32::read_from(packet)?;
                let Ok(port) = u32::read_from(packet)?.try_into() else {
                    return Err(TlError::InvalidData);
                };
                SocketAddr::V4(SocketAddrV4::new(ip.into(), port))
            }
            ADDRESS_V6_TL_ID => {
                let octets = <[u8; 16]>::read_from(packet)?;
                let Ok(port) = u32::read_from(packet)?.try_into() else {
                    return Err(TlError::InvalidData);
                };
                SocketAddr::V6(SocketAddrV6::new(octets.into(), port, 0, 0))
            }
            _ => return Err(TlError::UnknownConstructor),
        }))
    }
}

const ADDRESS_V4_TL_ID: u32 = 0x670da6e7;
const ADDRESS_V6_TL_ID: u32 = 0xe31d63fa;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tl_round_trip() {
        for addr in ["127.0.0.1:4000", "[::1]:30303"] {
            let addr = addr.parse::<Address>().unwrap();
            let bytes = tl_proto::serialize(addr);
            assert_eq!(bytes.len(), addr.max_size_hint());
            assert_eq!(tl_proto::deserialize::<Address>(&bytes).unwrap(), addr);
        }
    }
}
