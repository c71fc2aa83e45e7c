//! The blake3 content digest and the order-independent range summary.

use std::{fmt, str::FromStr};

use serde::{
    de::{self, SeqAccess},
    ser::SerializeTuple,
    Deserialize, Deserializer, Serialize, Serializer,
};

/// Content digest used throughout.
///
/// Identifies a blob by its bytes alone, independent of which node stores it
/// or under which path.
#[derive(PartialEq, Eq, Copy, Clone, Hash)]
pub struct Digest(blake3::Hash);

impl Digest {
    /// Calculate the digest of the provided bytes.
    pub fn new(buf: impl AsRef<[u8]>) -> Self {
        Self(blake3::hash(buf.as_ref()))
    }

    /// Bytes of the digest.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Create a `Digest` from its raw bytes representation.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(blake3::Hash::from_bytes(bytes))
    }

    /// Convert the digest to a hex string.
    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    /// The first 8 hex chars, for log output.
    pub fn fmt_short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl From<[u8; 32]> for Digest {
    fn from(value: [u8; 32]) -> Self {
        Self(blake3::Hash::from(value))
    }
}

impl From<&[u8; 32]> for Digest {
    fn from(value: &[u8; 32]) -> Self {
        Self(blake3::Hash::from(*value))
    }
}

impl From<Digest> for [u8; 32] {
    fn from(value: Digest) -> Self {
        *value.as_bytes()
    }
}

impl PartialOrd for Digest {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Digest {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.as_bytes().cmp(other.0.as_bytes())
    }
}

impl FromStr for Digest {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        anyhow::ensure!(s.len() == 64, "invalid hex length");
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| anyhow::anyhow!("invalid hex"))?;
        Ok(Self::from(bytes))
    }
}

impl Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            // Fixed-length structures, including arrays, are supported in Serde as tuples
            // See: https://serde.rs/impl-serialize.html#serializing-a-tuple
            let mut s = serializer.serialize_tuple(32)?;
            for item in self.0.as_bytes() {
                s.serialize_element(item)?;
            }
            s.end()
        }
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(de::Error::custom)
        } else {
            deserializer.deserialize_tuple(32, Bytes32Visitor).map(Self::from)
        }
    }
}

struct Bytes32Visitor;

impl<'de> de::Visitor<'de> for Bytes32Visitor {
    type Value = [u8; 32];

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "an array of 32 bytes")
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut arr = [0u8; 32];
        let mut i = 0;
        while let Some(val) = seq.next_element()? {
            if i >= 32 {
                return Err(de::Error::invalid_length(i + 1, &self));
            }
            arr[i] = val;
            i += 1;
        }
        if i != 32 {
            return Err(de::Error::invalid_length(i, &self));
        }
        Ok(arr)
    }
}

/// Order-independent fingerprint of a set of log entries.
///
/// The summary of a clock range is the XOR fold of `blake3(digest || clock)`
/// over every entry in the range. XOR is commutative, so two replicas holding
/// the same (digest, clock) pairs produce the same summary no matter in which
/// order the entries were inserted. The empty range folds to all zeroes.
///
/// Two replicas are in sync over a range iff their summaries for that range
/// are equal.
#[derive(PartialEq, Eq, Copy, Clone, Hash, Default)]
pub struct Summary([u8; 32]);

impl Summary {
    /// The summary of the empty range.
    pub const EMPTY: Summary = Summary([0u8; 32]);

    /// Create a `Summary` from its raw bytes representation.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Bytes of the summary.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Fold one (digest, clock) entry into the summary.
    pub fn insert(&mut self, digest: &Digest, clock: u64) {
        let mut hasher = blake3::Hasher::new();
        hasher.update(digest.as_bytes());
        hasher.update(&clock.to_le_bytes());
        let entry = hasher.finalize();
        for (acc, byte) in self.0.iter_mut().zip(entry.as_bytes()) {
            *acc ^= byte;
        }
    }

    /// Whether this is the summary of the empty range.
    pub fn is_empty(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Convert the summary to a hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromIterator<(Digest, u64)> for Summary {
    fn from_iter<T: IntoIterator<Item = (Digest, u64)>>(iter: T) -> Self {
        let mut summary = Summary::EMPTY;
        for (digest, clock) in iter {
            summary.insert(&digest, clock);
        }
        summary
    }
}

impl fmt::Debug for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Summary({})", self.to_hex())
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Summary {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        anyhow::ensure!(s.len() == 64, "invalid hex length");
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| anyhow::anyhow!("invalid hex"))?;
        Ok(Self(bytes))
    }
}

impl Serialize for Summary {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            let mut s = serializer.serialize_tuple(32)?;
            for item in &self.0 {
                s.serialize_element(item)?;
            }
            s.end()
        }
    }
}

impl<'de> Deserialize<'de> for Summary {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(de::Error::custom)
        } else {
            deserializer.deserialize_tuple(32, Bytes32Visitor).map(Self)
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn digest_hex_roundtrip() {
        let digest = Digest::new(b"hello");
        let hex = digest.to_hex();
        assert_eq!(hex.len(), 64);
        let back: Digest = hex.parse().unwrap();
        assert_eq!(digest, back);
    }

    #[test]
    fn digest_postcard_roundtrip() {
        let digest = Digest::new(b"hello");
        let bytes = postcard::to_stdvec(&digest).unwrap();
        assert_eq!(bytes.len(), 32);
        let back: Digest = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(digest, back);
    }

    #[test]
    fn summary_order_independent() {
        let mut rng = rand_chacha::ChaCha12Rng::seed_from_u64(7);
        let mut entries: Vec<(Digest, u64)> = (1u64..=64)
            .map(|clock| (Digest::new(clock.to_le_bytes()), clock))
            .collect();
        let ordered: Summary = entries.iter().cloned().collect();
        entries.shuffle(&mut rng);
        let shuffled: Summary = entries.into_iter().collect();
        assert_eq!(ordered, shuffled);
        assert!(!ordered.is_empty());
    }

    #[test]
    fn summary_empty_range_is_zero() {
        let summary: Summary = std::iter::empty().collect();
        assert_eq!(summary, Summary::EMPTY);
        assert!(summary.is_empty());
    }

    #[test]
    fn summary_differs_on_clock() {
        let digest = Digest::new(b"same bytes");
        let mut a = Summary::EMPTY;
        a.insert(&digest, 1);
        let mut b = Summary::EMPTY;
        b.insert(&digest, 2);
        assert_ne!(a, b);
    }
}
