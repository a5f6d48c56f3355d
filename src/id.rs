use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;

use crate::peer::Peer;

/// Width of the identifier space. SHA-1 digests are 160 bits, so the ring
/// holds 2^160 positions.
pub const ID_BITS: usize = 160;

const ID_BYTES: usize = ID_BITS / 8;

/// A position on the ring. Stored big-endian, so the derived `Ord` is the
/// numeric order of the underlying 160-bit integer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Id([u8; ID_BYTES]);

impl Id {
    /// Hash arbitrary bytes onto the ring.
    pub fn hash(bytes: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        Id(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// True when `x` lies on the clockwise arc `(lower, upper]`.
    /// `lower == upper` reads as the whole ring: walking clockwise from
    /// `lower` all the way around ends back at `upper`, so every position
    /// qualifies.
    pub fn between(lower: Id, x: Id, upper: Id) -> bool {
        if lower == upper {
            return true;
        }
        if lower < upper {
            lower < x && x <= upper
        } else {
            // the arc wraps past zero
            lower < x || x <= upper
        }
    }

    /// True when `x` lies on the open clockwise arc `(lower, upper)`.
    /// False whenever `x` equals either endpoint; `lower == upper` reads as
    /// the whole ring minus that single position.
    pub fn strictly_between(lower: Id, x: Id, upper: Id) -> bool {
        if lower == upper {
            return x != lower;
        }
        if lower < upper {
            lower < x && x < upper
        } else {
            lower < x || x < upper
        }
    }

    /// `self + 2^i mod 2^160`, the ring position finger slot `i` is
    /// responsible for.
    pub fn finger_offset(&self, i: usize) -> Id {
        debug_assert!(i < ID_BITS);
        Id::from_biguint(BigUint::from_bytes_be(&self.0) + (BigUint::from(1u8) << i))
    }

    /// Clockwise distance from `self` to `other`.
    pub fn distance_to(&self, other: Id) -> BigUint {
        let modulus = BigUint::from(1u8) << ID_BITS;
        let from = BigUint::from_bytes_be(&self.0);
        let to = BigUint::from_bytes_be(&other.0);
        (modulus.clone() + to - from) % modulus
    }

    fn from_biguint(value: BigUint) -> Id {
        let value = value % (BigUint::from(1u8) << ID_BITS);
        let bytes = value.to_bytes_be();
        let mut out = [0u8; ID_BYTES];
        out[ID_BYTES - bytes.len()..].copy_from_slice(&bytes);
        Id(out)
    }
}

/// Among `candidates`, the peer strictly inside `(self_id, target)` whose id
/// is closest to `target` walking clockwise. Routing uses this to pick the
/// next hop for a lookup.
pub fn closest_preceding<'a, I>(self_id: Id, target: Id, candidates: I) -> Option<Peer>
where
    I: IntoIterator<Item = &'a Peer>,
{
    candidates
        .into_iter()
        .filter(|peer| Id::strictly_between(self_id, peer.id, target))
        .min_by_key(|peer| peer.id.distance_to(target))
        .cloned()
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> Id {
        let mut bytes = [0u8; ID_BYTES];
        bytes[ID_BYTES - 8..].copy_from_slice(&n.to_be_bytes());
        Id(bytes)
    }

    #[test]
    fn hash_is_deterministic_sha1() {
        let digest = Id::hash(b"hello");
        assert_eq!(
            digest.to_string(),
            "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"
        );
        assert_eq!(digest, Id::hash(b"hello"));
    }

    #[test]
    fn between_is_inclusive_of_upper() {
        assert!(Id::between(id(10), id(20), id(20)));
        assert!(Id::between(id(10), id(15), id(20)));
        assert!(!Id::between(id(10), id(10), id(20)));
        assert!(!Id::between(id(10), id(25), id(20)));
    }

    #[test]
    fn between_wraps_past_zero() {
        // arc from 200 around through zero up to 100
        assert!(Id::between(id(200), id(250), id(100)));
        assert!(Id::between(id(200), id(5), id(100)));
        assert!(Id::between(id(200), id(100), id(100)));
        assert!(!Id::between(id(200), id(150), id(100)));
        assert!(!Id::between(id(200), id(200), id(100)));
    }

    #[test]
    fn degenerate_interval_is_whole_ring() {
        assert!(Id::between(id(7), id(7), id(7)));
        assert!(Id::between(id(7), id(1000), id(7)));
        assert!(Id::strictly_between(id(7), id(1000), id(7)));
        assert!(!Id::strictly_between(id(7), id(7), id(7)));
    }

    #[test]
    fn strictly_between_excludes_endpoints() {
        assert!(!Id::strictly_between(id(10), id(10), id(20)));
        assert!(!Id::strictly_between(id(10), id(20), id(20)));
        assert!(Id::strictly_between(id(10), id(11), id(20)));

        // same rules on a wrapped arc
        assert!(!Id::strictly_between(id(200), id(200), id(100)));
        assert!(!Id::strictly_between(id(200), id(100), id(100)));
        assert!(Id::strictly_between(id(200), id(0), id(100)));
    }

    #[test]
    fn finger_offset_adds_powers_of_two() {
        assert_eq!(id(1).finger_offset(0), id(2));
        assert_eq!(id(1).finger_offset(10), id(1025));
    }

    #[test]
    fn finger_offset_wraps_at_the_top_bit() {
        // x + 2^159 + 2^159 == x mod 2^160
        let base = id(42);
        let half = base.finger_offset(ID_BITS - 1);
        assert_ne!(half, base);
        assert_eq!(half.finger_offset(ID_BITS - 1), base);
    }

    #[test]
    fn distance_is_clockwise() {
        assert_eq!(id(10).distance_to(id(15)), BigUint::from(5u8));
        // going the other way wraps the whole ring minus five
        let wrapped = id(15).distance_to(id(10));
        assert_eq!(wrapped, (BigUint::from(1u8) << ID_BITS) - BigUint::from(5u8));
    }

    #[test]
    fn closest_preceding_picks_the_nearest_candidate() {
        let peers: Vec<Peer> = vec![
            Peer::with_id(id(20), "10.0.0.1:4000"),
            Peer::with_id(id(40), "10.0.0.2:4000"),
            Peer::with_id(id(90), "10.0.0.3:4000"),
        ];
        let next = closest_preceding(id(10), id(50), peers.iter()).unwrap();
        assert_eq!(next.id, id(40));

        // candidates at or past the target are not preceding
        let next = closest_preceding(id(10), id(20), peers.iter());
        assert!(next.is_none());
    }

    #[test]
    fn closest_preceding_handles_wraparound_targets() {
        let peers: Vec<Peer> = vec![
            Peer::with_id(id(200), "10.0.0.1:4000"),
            Peer::with_id(id(250), "10.0.0.2:4000"),
        ];
        // target 100 lies past zero from self at 150
        let next = closest_preceding(id(150), id(100), peers.iter()).unwrap();
        assert_eq!(next.id, id(250));
    }
}
