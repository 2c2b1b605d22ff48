//! # Ring Arithmetic
//!
//! Every node, key and finger target lives on a circle of `2^256` positions.
//! A [`RingId`] is a 256-bit unsigned integer stored big-endian, so the derived
//! byte ordering is the numeric ordering and the hex form sorts the same way.
//!
//! | Operation | Meaning |
//! |-----------|---------|
//! | [`distance`] | shortest undirected arc between two positions, `0..=HALF_MAX` |
//! | [`directed_distance`] | clockwise arc from `a` to `b` |
//! | [`closest`] | first candidate minimizing [`distance`] to a target |
//! | [`ideal_finger`] | `id + HALF_MAX + HALF_MAX/2 + ... ` for levels `0..=level` |
//! | [`good_enough`] | acceptance band around an ideal finger position |
//! | [`yield_to_id`] | deterministic glare tie-break |
//! | [`in_arc`] | clockwise arc membership (inclusive) |
//!
//! All arithmetic wraps at the modulus. Distances are ring values too and use
//! the same type.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Width of an identifier in bytes.
pub const ID_LEN: usize = 32;

/// Number of bits in the ring modulus (`MAX = 2^256`).
pub const RING_BITS: usize = ID_LEN * 8;

/// `MAX / 2`, the largest possible undirected [`distance`].
pub const HALF_MAX: RingId = RingId(half_max_bytes());

const fn half_max_bytes() -> [u8; ID_LEN] {
    let mut bytes = [0u8; ID_LEN];
    bytes[0] = 0x80;
    bytes
}

/// A position on the identifier ring.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RingId([u8; ID_LEN]);

/// A ring distance. Same representation as a position.
pub type Distance = RingId;

impl RingId {
    pub const ZERO: RingId = RingId([0u8; ID_LEN]);

    #[inline]
    pub const fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// Hash arbitrary bytes onto the ring.
    pub fn hash_of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// Parse a full-width hex id. Shorter strings are treated as a prefix and
    /// right-padded with zeros, which keeps `"7b"` meaning "the 7b.. region".
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        if s.len() > ID_LEN * 2 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut padded = String::with_capacity(ID_LEN * 2);
        padded.push_str(s);
        while padded.len() < ID_LEN * 2 {
            padded.push('0');
        }
        let bytes = hex::decode(&padded)?;
        let mut arr = [0u8; ID_LEN];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// First six hex digits, for log lines.
    pub fn short_name(&self) -> String {
        hex::encode(&self.0[..3])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    pub fn wrapping_add(self, rhs: RingId) -> RingId {
        self.overflowing_add(rhs).0
    }

    /// Addition that reports when the result left the ring.
    pub fn checked_add(self, rhs: RingId) -> Option<RingId> {
        match self.overflowing_add(rhs) {
            (sum, false) => Some(sum),
            (_, true) => None,
        }
    }

    fn overflowing_add(self, rhs: RingId) -> (RingId, bool) {
        let mut out = [0u8; ID_LEN];
        let mut carry = 0u16;
        for i in (0..ID_LEN).rev() {
            let sum = self.0[i] as u16 + rhs.0[i] as u16 + carry;
            out[i] = sum as u8;
            carry = sum >> 8;
        }
        (RingId(out), carry != 0)
    }

    pub fn wrapping_sub(self, rhs: RingId) -> RingId {
        let mut out = [0u8; ID_LEN];
        let mut borrow = 0i16;
        for i in (0..ID_LEN).rev() {
            let mut diff = self.0[i] as i16 - rhs.0[i] as i16 - borrow;
            if diff < 0 {
                diff += 256;
                borrow = 1;
            } else {
                borrow = 0;
            }
            out[i] = diff as u8;
        }
        RingId(out)
    }

    /// Logical right shift. Shifting by the full width or more yields zero.
    pub fn shr(self, bits: usize) -> RingId {
        if bits >= RING_BITS {
            return RingId::ZERO;
        }
        let byte_shift = bits / 8;
        let bit_shift = bits % 8;
        let mut out = [0u8; ID_LEN];
        for i in (byte_shift..ID_LEN).rev() {
            let src = i - byte_shift;
            let mut value = self.0[src] >> bit_shift;
            if bit_shift > 0 && src > 0 {
                value |= self.0[src - 1] << (8 - bit_shift);
            }
            out[i] = value;
        }
        RingId(out)
    }
}

impl std::fmt::Debug for RingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RingId({})", self.short_name())
    }
}

impl std::fmt::Display for RingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; ID_LEN]> for RingId {
    fn from(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl std::str::FromStr for RingId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for RingId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for RingId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.len() != ID_LEN * 2 {
            return Err(serde::de::Error::custom("ring id must be 64 hex digits"));
        }
        RingId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Ring Operations
// ============================================================================

/// Shortest undirected distance between `a` and `b`.
pub fn distance(a: RingId, b: RingId) -> Distance {
    let forward = b.wrapping_sub(a);
    if forward > HALF_MAX {
        a.wrapping_sub(b)
    } else {
        forward
    }
}

/// Clockwise distance from `a` to `b`.
pub fn directed_distance(a: RingId, b: RingId) -> Distance {
    b.wrapping_sub(a)
}

/// The candidate closest to `target`; ties keep the earliest candidate.
/// Returns `None` only for an empty candidate list.
pub fn closest<'a, I>(target: RingId, candidates: I) -> Option<RingId>
where
    I: IntoIterator<Item = &'a RingId>,
{
    let mut best: Option<(RingId, Distance)> = None;
    for candidate in candidates {
        let d = distance(target, *candidate);
        match best {
            Some((_, best_d)) if d >= best_d => {}
            _ => best = Some((*candidate, d)),
        }
    }
    best.map(|(id, _)| id)
}

/// `HALF_MAX >> level`.
#[inline]
pub fn half_max_shr(level: usize) -> Distance {
    HALF_MAX.shr(level)
}

/// Ideal ring position for finger `level`: each level adds the next halving
/// of `HALF_MAX`, so level 0 sits opposite `id` and later levels move further
/// clockwise in shrinking steps.
pub fn ideal_finger(id: RingId, level: usize) -> RingId {
    let mut ideal = id;
    for step in 0..=level {
        ideal = ideal.wrapping_add(half_max_shr(step));
    }
    ideal
}

/// Whether `candidate` is close enough to the ideal position of finger `level`.
pub fn good_enough(id: RingId, candidate: RingId, level: usize) -> bool {
    distance(ideal_finger(id, level), candidate) < half_max_shr(level + 2)
}

/// Glare tie-break: `true` if `local` must give way to `remote`.
///
/// Exactly one of `yield_to_id(a, b)` and `yield_to_id(b, a)` is true for
/// distinct ids. Antipodal pairs fall back to numeric order.
pub fn yield_to_id(local: RingId, remote: RingId) -> bool {
    let d = directed_distance(local, remote);
    if d == HALF_MAX {
        local < remote
    } else {
        d < HALF_MAX
    }
}

/// Whether `key` lies on the clockwise arc `[start, end]`.
pub fn in_arc(start: RingId, end: RingId, key: RingId) -> bool {
    directed_distance(start, key) <= directed_distance(start, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(prefix: &str) -> RingId {
        RingId::from_hex(prefix).unwrap()
    }

    fn sample_ids(n: usize) -> Vec<RingId> {
        (0..n as u64).map(|i| RingId::hash_of(&i.to_le_bytes())).collect()
    }

    #[test]
    fn distance_is_symmetric_and_bounded() {
        let ids = sample_ids(40);
        for a in &ids {
            for b in &ids {
                let d = distance(*a, *b);
                assert_eq!(d, distance(*b, *a));
                assert!(d <= HALF_MAX);
            }
        }
    }

    #[test]
    fn directed_distances_cancel() {
        let ids = sample_ids(40);
        for a in &ids {
            for b in &ids {
                let sum = directed_distance(*a, *b).wrapping_add(directed_distance(*b, *a));
                assert!(sum.is_zero());
            }
        }
    }

    #[test]
    fn antipodal_distance_is_half_max() {
        let a = id("10");
        let b = a.wrapping_add(HALF_MAX);
        assert_eq!(distance(a, b), HALF_MAX);
        assert_eq!(distance(b, a), HALF_MAX);
    }

    #[test]
    fn closest_wraps_around_the_ring() {
        let ring: Vec<RingId> = ["01", "43", "62", "7b", "aa", "cc", "dd"]
            .iter()
            .map(|p| id(p))
            .collect();
        assert_eq!(closest(id("fb"), &ring), Some(id("01")));
        assert_eq!(closest(id("49"), &ring), Some(id("43")));
        assert_eq!(closest(id("49"), &[]), None);
    }

    #[test]
    fn closest_keeps_first_on_tie() {
        let a = id("40");
        let b = id("60");
        assert_eq!(closest(id("50"), &[a, b]), Some(a));
        assert_eq!(closest(id("50"), &[b, a]), Some(b));
    }

    #[test]
    fn closest_returns_a_member() {
        let ids = sample_ids(16);
        for target in sample_ids(64).iter().skip(16) {
            let c = closest(*target, &ids).unwrap();
            assert!(ids.contains(&c));
        }
    }

    #[test]
    fn shr_moves_bits_across_bytes() {
        assert_eq!(HALF_MAX.shr(1), id("40"));
        assert_eq!(HALF_MAX.shr(8), id("0080"));
        assert_eq!(HALF_MAX.shr(255), RingId::from_bytes({
            let mut b = [0u8; ID_LEN];
            b[ID_LEN - 1] = 1;
            b
        }));
        assert!(HALF_MAX.shr(256).is_zero());
    }

    #[test]
    fn ideal_finger_accumulates_offsets() {
        let base = RingId::ZERO;
        assert_eq!(ideal_finger(base, 0), id("80"));
        assert_eq!(ideal_finger(base, 1), id("c0"));
        assert_eq!(ideal_finger(base, 2), id("e0"));
        // wraps past the modulus
        assert_eq!(ideal_finger(id("80"), 0), RingId::ZERO);
    }

    #[test]
    fn good_enough_uses_shrinking_band() {
        let base = RingId::ZERO;
        // level 0 ideal is 80.., band is HALF_MAX >> 2 = 20..
        assert!(good_enough(base, id("9f"), 0));
        assert!(!good_enough(base, id("a1"), 0));
        // level 1 ideal is c0.., band is 10..
        assert!(good_enough(base, id("cf"), 1));
        assert!(!good_enough(base, id("d1"), 1));
    }

    #[test]
    fn exactly_one_side_yields() {
        let ids = sample_ids(30);
        for a in &ids {
            for b in &ids {
                if a != b {
                    assert_ne!(yield_to_id(*a, *b), yield_to_id(*b, *a));
                }
            }
        }
        let a = id("10");
        let b = a.wrapping_add(HALF_MAX);
        assert_ne!(yield_to_id(a, b), yield_to_id(b, a));
    }

    #[test]
    fn arc_membership_handles_wraparound() {
        assert!(in_arc(id("01"), id("ff"), id("02")));
        assert!(!in_arc(id("cc"), id("33"), id("cb")));
        assert!(in_arc(id("cc"), id("33"), id("cd")));
        assert!(in_arc(id("cc"), id("33"), id("10")));
    }

    #[test]
    fn checked_add_detects_full_circle() {
        let quarter = HALF_MAX.shr(1);
        let three_quarters = quarter.wrapping_add(HALF_MAX);
        assert!(three_quarters.checked_add(quarter).is_none());
        assert_eq!(quarter.checked_add(quarter), Some(HALF_MAX));
    }

    #[test]
    fn hex_round_trips_through_serde() {
        let original = RingId::hash_of(b"ring");
        let json = serde_json::to_string(&original).unwrap();
        assert_eq!(json.len(), 66);
        let parsed: RingId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, original);
        assert!(serde_json::from_str::<RingId>("\"abcd\"").is_err());
    }
}
