//! InfiniBand port GUID value and allocation pool (spec.md §3, §4.1).
//!
//! A GUID is a 64-bit value rendered as eight colon-separated hex
//! octets. The pool is a closed interval `[range_start, range_end]`
//! plus a set of currently-allocated members and a rotating cursor
//! used by `generate` to spread allocations across the range.

use std::collections::HashMap;
use std::fmt;

use crate::error::{ControllerError, Result};

const ALL_ZERO: [u8; 8] = [0; 8];
const ALL_ONE: [u8; 8] = [0xFF; 8];

/// A 64-bit InfiniBand port GUID. Carries no ownership; identity is the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Guid([u8; 8]);

impl Guid {
    /// Parse `"02:FF:00:00:00:00:00:01"`-style input. Rejects all-zero and all-ones.
    pub fn parse(s: &str) -> Result<Self> {
        let octets: Vec<&str> = s.split(':').collect();
        if octets.len() != 8 {
            return Err(ControllerError::BadInput(format!(
                "guid must have 8 colon-separated octets: {s}"
            )));
        }
        let mut bytes = [0u8; 8];
        for (i, octet) in octets.iter().enumerate() {
            if octet.len() != 2 {
                return Err(ControllerError::BadInput(format!(
                    "guid octet must be 2 hex digits: {s}"
                )));
            }
            bytes[i] = u8::from_str_radix(octet, 16)
                .map_err(|_| ControllerError::BadInput(format!("invalid hex octet in guid: {s}")))?;
        }
        if bytes == ALL_ZERO {
            return Err(ControllerError::BadInput("guid is the all-zero sentinel".into()));
        }
        if bytes == ALL_ONE {
            return Err(ControllerError::BadInput("guid is the broadcast sentinel".into()));
        }
        Ok(Guid(bytes))
    }

    /// Canonical lower-hex, colon-separated rendering.
    pub fn format(&self) -> String {
        self.0
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":")
    }

    fn as_u64(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }

    fn from_u64(v: u64) -> Self {
        Guid(v.to_be_bytes())
    }

    /// Bytewise successor with 8-bit carry propagation across the buffer,
    /// wrapping `ff:ff:..:ff` to `00:00:..:00`.
    fn successor(&self) -> Self {
        Guid::from_u64(self.as_u64().wrapping_add(1))
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format())
    }
}

/// Reserved for future per-allocation bookkeeping; presently just marks membership.
#[derive(Debug, Clone, Default)]
pub struct GuidMeta;

/// An ordered closed interval of GUIDs plus the set currently reserved.
pub struct Pool {
    range_start: Guid,
    range_end: Guid,
    allocated: HashMap<Guid, GuidMeta>,
    next: Guid,
}

impl Pool {
    /// Parses and validates `range_start <= range_end`; starts with an empty pool.
    pub fn new(range_start: &str, range_end: &str) -> Result<Self> {
        let range_start = Guid::parse(range_start)?;
        let range_end = Guid::parse(range_end)?;
        if range_start.as_u64() > range_end.as_u64() {
            return Err(ControllerError::Config(format!(
                "guid pool range start {range_start} is greater than range end {range_end}"
            )));
        }
        Ok(Pool {
            range_start,
            range_end,
            allocated: HashMap::new(),
            next: range_start,
        })
    }

    pub fn range_start(&self) -> Guid {
        self.range_start
    }

    pub fn range_end(&self) -> Guid {
        self.range_end
    }

    fn in_range(&self, g: Guid) -> bool {
        g.as_u64() >= self.range_start.as_u64() && g.as_u64() <= self.range_end.as_u64()
    }

    fn range_size(&self) -> u128 {
        (self.range_end.as_u64() as u128) - (self.range_start.as_u64() as u128) + 1
    }

    /// Reserve a specific GUID. `OutOfRange` if outside the pool, `AlreadyAllocated` if taken.
    pub fn allocate(&mut self, g: Guid) -> Result<()> {
        if !self.in_range(g) {
            return Err(ControllerError::OutOfRange(g.format()));
        }
        if self.allocated.contains_key(&g) {
            return Err(ControllerError::AlreadyAllocated(g.format()));
        }
        self.allocated.insert(g, GuidMeta);
        Ok(())
    }

    /// Release a previously-allocated GUID. `NotAllocated` if absent.
    pub fn release(&mut self, g: Guid) -> Result<()> {
        if self.allocated.remove(&g).is_none() {
            return Err(ControllerError::NotAllocated(g.format()));
        }
        Ok(())
    }

    /// Returns metadata for a currently-allocated GUID, `NotAllocated` otherwise.
    pub fn get(&self, g: Guid) -> Result<&GuidMeta> {
        self.allocated
            .get(&g)
            .ok_or_else(|| ControllerError::NotAllocated(g.format()))
    }

    pub fn is_allocated(&self, g: Guid) -> bool {
        self.allocated.contains_key(&g)
    }

    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }

    /// Returns the next free GUID starting from the cursor, sweeping
    /// `[next, end] ∪ [start, next)`, and advances the cursor to its
    /// successor (wrapping `end -> start`). Does not allocate it.
    pub fn generate(&mut self) -> Result<Guid> {
        let total = self.range_size();
        let mut candidate = self.next;
        let mut visited: u128 = 0;

        loop {
            if !self.allocated.contains_key(&candidate) {
                self.next = if candidate == self.range_end {
                    self.range_start
                } else {
                    candidate.successor()
                };
                return Ok(candidate);
            }

            candidate = if candidate == self.range_end {
                self.range_start
            } else {
                candidate.successor()
            };

            visited += 1;
            if visited >= total {
                return Err(ControllerError::PoolExhausted);
            }
        }
    }

    /// Discards the current allocation set and repopulates it from `seed`.
    /// Any invalid or out-of-range entry fails the whole call, leaving the
    /// pool untouched.
    pub fn reset(&mut self, seed: Option<&[Guid]>) -> Result<()> {
        let seed = match seed {
            Some(s) => s,
            None => {
                self.allocated.clear();
                return Ok(());
            }
        };
        for g in seed {
            if !self.in_range(*g) {
                return Err(ControllerError::OutOfRange(g.format()));
            }
        }
        let mut fresh = HashMap::with_capacity(seed.len());
        for g in seed {
            fresh.insert(*g, GuidMeta);
        }
        self.allocated = fresh;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_roundtrips_format() {
        let s = "02:ff:00:00:00:00:00:01";
        let g = Guid::parse(s).unwrap();
        assert_eq!(g.format(), s);
    }

    #[test]
    fn parse_rejects_sentinels() {
        assert!(Guid::parse("00:00:00:00:00:00:00:00").is_err());
        assert!(Guid::parse("ff:ff:ff:ff:ff:ff:ff:ff").is_err());
    }

    #[test]
    fn parse_rejects_wrong_octet_count() {
        assert!(Guid::parse("02:00:00:00:00:00:01").is_err());
    }

    #[test]
    fn parse_then_format_is_identity_for_many_values() {
        for v in [1u64, 2, 255, 256, 0x0200000000000001, 0xFFFFFFFFFFFFFFFE] {
            let g = Guid::from_u64(v);
            let formatted = g.format();
            let reparsed = Guid::parse(&formatted).unwrap();
            assert_eq!(g, reparsed);
        }
    }

    #[test]
    fn allocate_then_release_restores_empty_pool() {
        let mut pool = Pool::new("02:00:00:00:00:00:00:00", "02:00:00:00:00:00:00:ff").unwrap();
        let g = Guid::parse("02:00:00:00:00:00:00:03").unwrap();
        pool.allocate(g).unwrap();
        assert_eq!(pool.allocated_count(), 1);
        pool.release(g).unwrap();
        assert_eq!(pool.allocated_count(), 0);
    }

    #[test]
    fn allocate_rejects_out_of_range() {
        let mut pool = Pool::new("02:00:00:00:00:00:00:00", "02:00:00:00:00:00:00:0f").unwrap();
        let outside = Guid::parse("02:00:00:00:00:00:00:ff").unwrap();
        assert!(matches!(
            pool.allocate(outside),
            Err(ControllerError::OutOfRange(_))
        ));
    }

    #[test]
    fn allocate_rejects_double_allocation() {
        let mut pool = Pool::new("02:00:00:00:00:00:00:00", "02:00:00:00:00:00:00:0f").unwrap();
        let g = Guid::parse("02:00:00:00:00:00:00:03").unwrap();
        pool.allocate(g).unwrap();
        assert!(matches!(
            pool.allocate(g),
            Err(ControllerError::AlreadyAllocated(_))
        ));
    }

    #[test]
    fn release_rejects_unallocated() {
        let mut pool = Pool::new("02:00:00:00:00:00:00:00", "02:00:00:00:00:00:00:0f").unwrap();
        let g = Guid::parse("02:00:00:00:00:00:00:03").unwrap();
        assert!(matches!(
            pool.release(g),
            Err(ControllerError::NotAllocated(_))
        ));
    }

    #[test]
    fn single_element_range_generates_once_then_exhausts() {
        let mut pool = Pool::new("02:00:00:00:00:00:01:00", "02:00:00:00:00:00:01:00").unwrap();
        let g = pool.generate().unwrap();
        assert_eq!(g.format(), "02:00:00:00:00:00:01:00");
        pool.allocate(g).unwrap();
        assert!(matches!(pool.generate(), Err(ControllerError::PoolExhausted)));
    }

    #[test]
    fn generate_wraps_end_to_start() {
        let mut pool = Pool::new("02:00:00:00:00:00:00:00", "02:00:00:00:00:00:00:01").unwrap();
        let first = pool.generate().unwrap();
        pool.allocate(first).unwrap();
        let second = pool.generate().unwrap();
        pool.allocate(second).unwrap();
        assert_ne!(first, second);
        assert!(matches!(pool.generate(), Err(ControllerError::PoolExhausted)));
    }

    #[test]
    fn generate_visits_every_element_exactly_once_before_any_release() {
        let mut pool = Pool::new("02:00:00:00:00:00:00:00", "02:00:00:00:00:00:00:04").unwrap();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..5 {
            let g = pool.generate().unwrap();
            assert!(seen.insert(g), "generate returned a duplicate before any release");
            pool.allocate(g).unwrap();
        }
        assert!(matches!(pool.generate(), Err(ControllerError::PoolExhausted)));
    }

    #[test]
    fn reset_replaces_allocated_set() {
        let mut pool = Pool::new("02:00:00:00:00:00:00:00", "02:00:00:00:00:00:00:0f").unwrap();
        let g1 = Guid::parse("02:00:00:00:00:00:00:01").unwrap();
        pool.allocate(g1).unwrap();

        let g2 = Guid::parse("02:00:00:00:00:00:00:02").unwrap();
        let g3 = Guid::parse("02:00:00:00:00:00:00:03").unwrap();
        pool.reset(Some(&[g2, g3])).unwrap();

        assert!(!pool.is_allocated(g1));
        assert!(pool.is_allocated(g2));
        assert!(pool.is_allocated(g3));
    }

    #[test]
    fn reset_with_out_of_range_seed_fails_atomically() {
        let mut pool = Pool::new("02:00:00:00:00:00:00:00", "02:00:00:00:00:00:00:0f").unwrap();
        let g1 = Guid::parse("02:00:00:00:00:00:00:01").unwrap();
        pool.allocate(g1).unwrap();

        let bad = Guid::parse("02:00:00:00:00:00:01:00").unwrap();
        let result = pool.reset(Some(&[bad]));
        assert!(result.is_err());
        assert!(pool.is_allocated(g1), "pool must be unchanged on reset failure");
    }

    #[test]
    fn new_rejects_inverted_range() {
        let result = Pool::new("02:00:00:00:00:00:00:0f", "02:00:00:00:00:00:00:00");
        assert!(result.is_err());
    }
}
