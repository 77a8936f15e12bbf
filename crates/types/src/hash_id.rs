use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize};

/// Construction errors for [`Id20`] and its newtypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("expected {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },
    #[error("invalid hex byte {byte:#04x} at offset {offset}")]
    InvalidEncoding { byte: u8, offset: usize },
}

/// A 160-bit identifier: DHT node ids, torrent infohashes, peer ids.
///
/// Ordered lexicographically, which for the DHT doubles as the numeric
/// order of the 160-bit big-endian integer.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id20(pub [u8; 20]);

impl Id20 {
    pub const LEN: usize = 20;

    pub const ZERO: Id20 = Id20([0u8; 20]);
    pub const MAX: Id20 = Id20([0xff; 20]);

    pub fn new(bytes: [u8; 20]) -> Self {
        Id20(bytes)
    }

    pub fn from_bytes(b: &[u8]) -> Result<Self, IdError> {
        if b.len() != Self::LEN {
            return Err(IdError::InvalidLength {
                expected: Self::LEN,
                got: b.len(),
            });
        }
        let mut v = [0u8; 20];
        v.copy_from_slice(b);
        Ok(Id20(v))
    }

    /// Strict parse of a 40-character hex string. Any non-hex byte is an
    /// error, including mixed-in whitespace.
    pub fn from_hex(s: &str) -> Result<Self, IdError> {
        let raw = s.as_bytes();
        if raw.len() != Self::LEN * 2 {
            return Err(IdError::InvalidLength {
                expected: Self::LEN * 2,
                got: raw.len(),
            });
        }
        fn nibble(b: u8, offset: usize) -> Result<u8, IdError> {
            match b {
                b'0'..=b'9' => Ok(b - b'0'),
                b'a'..=b'f' => Ok(b - b'a' + 10),
                b'A'..=b'F' => Ok(b - b'A' + 10),
                other => Err(IdError::InvalidEncoding {
                    byte: other,
                    offset,
                }),
            }
        }
        let mut out = [0u8; 20];
        for (i, pair) in raw.chunks_exact(2).enumerate() {
            out[i] = (nibble(pair[0], i * 2)? << 4) | nibble(pair[1], i * 2 + 1)?;
        }
        Ok(Id20(out))
    }

    /// Generates an id from the thread-local CSPRNG.
    pub fn random() -> Self {
        let mut out = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut out);
        Id20(out)
    }

    pub fn as_string(&self) -> String {
        hex::encode(self.0)
    }

    /// XOR distance, itself a 160-bit integer.
    pub fn distance(&self, other: &Id20) -> Id20 {
        let mut xor = [0u8; 20];
        for (idx, (s, o)) in self.0.iter().zip(other.0.iter()).enumerate() {
            xor[idx] = s ^ o;
        }
        Id20(xor)
    }

    /// Bit 0 is the most significant bit of the first byte.
    pub fn get_bit(&self, bit: u8) -> bool {
        let n = self.0[(bit / 8) as usize];
        let mask = 1 << (7 - bit % 8);
        n & mask > 0
    }

    pub fn set_bit(&mut self, bit: u8, value: bool) {
        let n = &mut self.0[(bit / 8) as usize];
        if value {
            *n |= 1 << (7 - bit % 8)
        } else {
            *n &= !(1 << (7 - bit % 8))
        }
    }

    pub fn set_bits_range(&mut self, r: std::ops::Range<u8>, value: bool) {
        for bit in r {
            self.set_bit(bit, value)
        }
    }

    /// Number of leading bits shared with `other`.
    pub fn common_prefix_len(&self, other: &Id20) -> u32 {
        let mut count = 0u32;
        for (s, o) in self.0.iter().zip(other.0.iter()) {
            let xor = s ^ o;
            count += xor.leading_zeros().min(8);
            if xor != 0 {
                break;
            }
        }
        count
    }
}

impl std::fmt::Debug for Id20 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl std::fmt::Display for Id20 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

impl FromStr for Id20 {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Id20::from_hex(s)
    }
}

impl Serialize for Id20 {
    // Always 20 raw bytes: ids live on the bencode wire. Human-facing
    // formats go through `as_string()` explicitly.
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Id20 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct IdVisitor;

        impl<'de> serde::de::Visitor<'de> for IdVisitor {
            type Value = Id20;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("20 raw bytes or a 40-char hex string")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Id20::from_hex(v).map_err(E::custom)
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Id20::from_bytes(v).map_err(E::custom)
            }

            fn visit_borrowed_bytes<E>(self, v: &'de [u8]) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                self.visit_bytes(v)
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let mut out = [0u8; 20];
                for (i, slot) in out.iter_mut().enumerate() {
                    *slot = seq
                        .next_element::<u8>()?
                        .ok_or_else(|| serde::de::Error::invalid_length(i, &self))?;
                }
                if seq.next_element::<u8>()?.is_some() {
                    return Err(serde::de::Error::invalid_length(21, &self));
                }
                Ok(Id20(out))
            }
        }

        deserializer.deserialize_any(IdVisitor)
    }
}

macro_rules! id20_newtype {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(
            Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Id20);

        impl $name {
            pub fn new(bytes: [u8; 20]) -> Self {
                Self(Id20::new(bytes))
            }

            pub fn from_bytes(b: &[u8]) -> Result<Self, IdError> {
                Id20::from_bytes(b).map(Self)
            }

            pub fn from_hex(s: &str) -> Result<Self, IdError> {
                Id20::from_hex(s).map(Self)
            }

            pub fn random() -> Self {
                Self(Id20::random())
            }

            pub fn as_bytes(&self) -> &[u8; 20] {
                &self.0 .0
            }

            pub fn as_string(&self) -> String {
                self.0.as_string()
            }
        }

        impl From<Id20> for $name {
            fn from(id: Id20) -> Self {
                Self(id)
            }
        }

        impl From<$name> for Id20 {
            fn from(v: $name) -> Id20 {
                v.0
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                std::fmt::Debug::fmt(&self.0, f)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                std::fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Id20::from_hex(s).map(Self)
            }
        }
    };
}

id20_newtype!(NodeId, "Identity of a DHT participant.");
id20_newtype!(
    InfoHash,
    "SHA-1 of a torrent's bencoded info dictionary; identifies the torrent."
);

impl NodeId {
    pub fn distance(&self, other: &NodeId) -> Id20 {
        self.0.distance(&other.0)
    }
}

impl InfoHash {
    pub fn distance_to(&self, node: &NodeId) -> Id20 {
        self.0.distance(&node.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let s = "cfe1119f124881ca70f7306f32e292194c88c195";
        let id = Id20::from_hex(s).unwrap();
        assert_eq!(id.as_string(), s);
        assert_eq!(format!("{id:?}"), s);
    }

    #[test]
    fn hex_uppercase_accepted() {
        let id = Id20::from_hex("CFE1119F124881CA70F7306F32E292194C88C195").unwrap();
        assert_eq!(id.0[0], 0xcf);
    }

    #[test]
    fn hex_rejects_wrong_length() {
        assert_eq!(
            Id20::from_hex("abcd"),
            Err(IdError::InvalidLength {
                expected: 40,
                got: 4
            })
        );
    }

    #[test]
    fn hex_rejects_non_hex_bytes() {
        // 40 chars, one of them invalid; the lax path in older code let this through.
        let s = "cfe1119f124881ca70f7306f32e292194c88c19z";
        assert_eq!(
            Id20::from_hex(s),
            Err(IdError::InvalidEncoding {
                byte: b'z',
                offset: 39
            })
        );
        let s2 = "cfe1119f 124881ca70f7306f32e292194c88c19";
        assert!(matches!(
            Id20::from_hex(s2),
            Err(IdError::InvalidEncoding { byte: b' ', .. })
        ));
    }

    #[test]
    fn from_bytes_length_check() {
        assert_eq!(
            Id20::from_bytes(&[1, 2, 3]),
            Err(IdError::InvalidLength {
                expected: 20,
                got: 3
            })
        );
    }

    #[test]
    fn distance_is_xor() {
        let a = Id20::from_hex("0101010101010101010101010101010101010114").unwrap();
        let b = Id20::from_hex("1111111111111111111111111111111111111124").unwrap();
        let d = a.distance(&b);
        assert_eq!(
            d,
            Id20::from_hex("1010101010101010101010101010101010101030").unwrap()
        );
        assert_eq!(a.distance(&a), Id20::ZERO);
        assert_eq!(b.distance(&a), d);
    }

    #[test]
    fn ordering_matches_big_endian_integers() {
        let mut ids: Vec<Id20> = (0..64).map(|_| Id20::random()).collect();
        ids.sort();
        for pair in ids.windows(2) {
            assert!(pair[0].0 <= pair[1].0);
        }
    }

    #[test]
    fn bit_math() {
        let mut id = Id20::ZERO;
        id.set_bit(0, true);
        assert_eq!(id.0[0], 0x80);
        assert!(id.get_bit(0));
        id.set_bit(0, false);
        id.set_bits_range(9..17, true);
        assert_eq!(
            id,
            Id20::new([0, 127, 128, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0])
        );
    }

    #[test]
    fn common_prefix() {
        let a = Id20::from_hex("8000000000000000000000000000000000000000").unwrap();
        let b = Id20::from_hex("8000000000000000000000000000000000000001").unwrap();
        assert_eq!(a.common_prefix_len(&b), 159);
        assert_eq!(a.common_prefix_len(&Id20::ZERO), 0);
        assert_eq!(a.common_prefix_len(&a), 160);
    }

    #[test]
    fn newtypes_do_not_mix() {
        let n = NodeId::random();
        let h = InfoHash(n.0);
        assert_eq!(h.distance_to(&n), Id20::ZERO);
    }

    #[test]
    fn serde_bencode_is_raw_bytes() {
        let id = Id20::from_hex("cfe1119f124881ca70f7306f32e292194c88c195").unwrap();
        let enc = serde_bencode::to_bytes(&id).unwrap();
        let mut expected = b"20:".to_vec();
        expected.extend_from_slice(&id.0);
        assert_eq!(enc, expected);
        let back: Id20 = serde_bencode::from_bytes(&enc).unwrap();
        assert_eq!(back, id);
    }
}
