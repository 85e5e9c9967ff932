//! Core value types shared by every layer of the node.
//!
//! All byte newtypes render as `0x`-prefixed hex, both in [Debug] output and
//! in their JSON form (the wire protocol and the persisted layout are JSON).

use std::collections::BTreeMap;
use std::fmt::{self, Debug, Display};
use std::str::FromStr;

use rand::{distributions::Standard, prelude::Distribution};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use uint::construct_uint;

macro_rules! impl_hex_display {
    ($T:ident) => {
        impl Debug for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("0x")?;
                for b in self.0 {
                    f.write_fmt(format_args!("{:02x}", b))?;
                }
                Ok(())
            }
        }

        impl Display for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                Debug::fmt(self, f)
            }
        }
    };
}

macro_rules! bytes_newtype {
    ($T:ident, $N:literal) => {
        #[derive(PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Hash)]
        pub struct $T(pub [u8; $N]);

        impl Default for $T {
            fn default() -> Self {
                Self([0; $N])
            }
        }

        impl Distribution<$T> for Standard {
            fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> $T {
                $T(rng.gen())
            }
        }

        impl FromStr for $T {
            type Err = hex::FromHexError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let s = s.strip_prefix("0x").unwrap_or(s);
                let mut buf = [0u8; $N];
                hex::decode_to_slice(s, &mut buf)?;
                Ok($T(buf))
            }
        }

        impl Serialize for $T {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&format!("{:?}", self))
            }
        }

        impl<'de> Deserialize<'de> for $T {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(de::Error::custom)
            }
        }

        impl_hex_display!($T);
    };
}

bytes_newtype!(Address, 20);
bytes_newtype!(Destination, 32);
bytes_newtype!(Hash, 32);
bytes_newtype!(Signature, 65);

impl Signature {
    pub fn new(rs: &[u8; 64], v: u8) -> Self {
        let mut sig = Signature([0; 65]);
        sig.0[..64].copy_from_slice(rs);
        sig.0[64] = v;
        sig
    }

    /// True when no signature has been recorded in this slot.
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 65]
    }
}

impl Address {
    /// Embeds the address into the low 20 bytes of a 32-byte destination.
    pub fn to_destination(self) -> Destination {
        let mut d = Destination([0; 32]);
        d.0[12..].copy_from_slice(&self.0);
        d
    }
}

impl Destination {
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 32]
    }

    /// Extracts the address from the low 20 bytes.
    ///
    /// Only meaningful for destinations which embed a participant address
    /// (the high 12 bytes must be zero); channel IDs are full-width hashes.
    pub fn to_address(self) -> Option<Address> {
        if self.0[..12] != [0; 12] {
            return None;
        }
        let mut a = Address([0; 20]);
        a.0.copy_from_slice(&self.0[12..]);
        Some(a)
    }
}

impl From<Hash> for Destination {
    fn from(h: Hash) -> Self {
        Destination(h.0)
    }
}

construct_uint! {
    pub struct U256(4);
}

impl U256 {
    pub fn to_be_bytes(self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        self.to_big_endian(&mut bytes);
        bytes
    }

    pub fn from_be_bytes(bytes: [u8; 32]) -> Self {
        U256::from_big_endian(&bytes)
    }
}

// JSON form is a decimal string so that arbitrary 256-bit amounts survive
// parsers which only handle 64-bit numbers.
impl Serialize for U256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for U256 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        U256::from_dec_str(&s).map_err(de::Error::custom)
    }
}

impl Distribution<U256> for Standard {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> U256 {
        let buf: [u8; 32] = rng.gen();
        U256::from_big_endian(&buf)
    }
}

/// A mapping from asset address to a non-negative amount held in that asset.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Funds(pub BTreeMap<Address, U256>);

impl Funds {
    pub fn new() -> Self {
        Funds(BTreeMap::new())
    }

    pub fn single(asset: Address, amount: U256) -> Self {
        let mut f = Funds::new();
        f.0.insert(asset, amount);
        f
    }

    pub fn get(&self, asset: &Address) -> U256 {
        self.0.get(asset).copied().unwrap_or_default()
    }

    pub fn insert(&mut self, asset: Address, amount: U256) {
        self.0.insert(asset, amount);
    }

    /// True when at least one asset holds a non-zero amount.
    pub fn is_non_zero(&self) -> bool {
        self.0.values().any(|v| !v.is_zero())
    }

    /// True when every asset listed in `threshold` is held in at least
    /// that amount.
    pub fn covers(&self, threshold: &Funds) -> bool {
        threshold.0.iter().all(|(asset, t)| self.get(asset) >= *t)
    }

    /// Per-asset difference `self - other`, clamped at zero.
    pub fn saturating_sub(&self, other: &Funds) -> Funds {
        let mut out = Funds::new();
        for (asset, amount) in &self.0 {
            let rest = amount.checked_sub(other.get(asset)).unwrap_or_default();
            out.insert(*asset, rest);
        }
        out
    }

    /// Asset-wise sum.
    pub fn add(&self, other: &Funds) -> Funds {
        let mut out = self.clone();
        for (asset, amount) in &other.0 {
            let entry = out.0.entry(*asset).or_default();
            *entry = entry
                .checked_add(*amount)
                .expect("funds addition cannot exceed 2^256");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_destination_roundtrip() {
        let a: Address = rand::random();
        let d = a.to_destination();
        assert_eq!(d.to_address(), Some(a));
        assert_eq!(&d.0[..12], &[0; 12]);
    }

    #[test]
    fn channel_id_destination_has_no_address() {
        let mut d: Destination = Destination(rand::random::<Hash>().0);
        d.0[0] = 0xff;
        assert_eq!(d.to_address(), None);
    }

    #[test]
    fn u256_json_is_decimal() {
        let v = U256::from(12345u64);
        let s = serde_json::to_string(&v).unwrap();
        assert_eq!(s, "\"12345\"");
        let back: U256 = serde_json::from_str(&s).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn bytes_json_is_hex() {
        let a = Address([0xab; 20]);
        let s = serde_json::to_string(&a).unwrap();
        assert_eq!(s, format!("\"0x{}\"", "ab".repeat(20)));
        let back: Address = serde_json::from_str(&s).unwrap();
        assert_eq!(back, a);
    }

    #[test]
    fn funds_zero_and_sum() {
        let asset = Address::default();
        let mut f = Funds::new();
        assert!(!f.is_non_zero());
        f.insert(asset, U256::from(3u64));
        assert!(f.is_non_zero());
        let g = Funds::single(asset, U256::from(4u64));
        assert_eq!(f.add(&g).get(&asset), U256::from(7u64));
    }
}
