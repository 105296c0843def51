//! The bad-byte oracle.
//!
//! A [`BadByteSet`] answers one question: does a byte, buffer, or encoded
//! integer contain a forbidden value? It is built once per job from the
//! configuration and shared read-only by every pipeline stage. Membership is
//! a 256-entry table lookup, so queries cost the same regardless of how many
//! values are forbidden.

/// Set of byte values the output must not contain.
#[derive(Clone, PartialEq, Eq)]
pub struct BadByteSet {
    table: [bool; 256],
    cardinality: u16,
}

impl BadByteSet {
    /// Build a set containing exactly the given byte values.
    pub fn new(bytes: &[u8]) -> Self {
        let mut table = [false; 256];
        let mut cardinality = 0;
        for &b in bytes {
            if !table[usize::from(b)] {
                table[usize::from(b)] = true;
                cardinality += 1;
            }
        }
        Self { table, cardinality }
    }

    /// The common default: only `0x00` is forbidden.
    pub fn null_only() -> Self {
        Self::new(&[0x00])
    }

    /// A set forbidding nothing. A job configured with this set is an
    /// identity pass-through.
    pub fn empty() -> Self {
        Self::new(&[])
    }

    /// Is `byte` forbidden?
    #[inline]
    pub fn is_bad(&self, byte: u8) -> bool {
        self.table[usize::from(byte)]
    }

    /// Does `buf` consist solely of allowed bytes?
    #[inline]
    pub fn bytes_ok(&self, buf: &[u8]) -> bool {
        buf.iter().all(|&b| !self.is_bad(b))
    }

    /// Are all `width` little-endian constituent bytes of `value` allowed?
    ///
    /// `width` is in bytes and must be between 1 and 8.
    pub fn integer_ok(&self, value: u64, width: usize) -> bool {
        debug_assert!(width >= 1 && width <= 8);
        value
            .to_le_bytes()
            .iter()
            .take(width)
            .all(|&b| !self.is_bad(b))
    }

    /// Number of forbidden values in the set.
    pub fn cardinality(&self) -> usize {
        usize::from(self.cardinality)
    }

    /// True if nothing is forbidden.
    pub fn is_empty(&self) -> bool {
        self.cardinality == 0
    }

    /// Iterate over the allowed byte values in ascending order.
    pub fn clean_bytes(&self) -> impl Iterator<Item = u8> + '_ {
        (0u16..256).map(|b| b as u8).filter(move |&b| !self.is_bad(b))
    }
}

impl core::fmt::Debug for BadByteSet {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "BadByteSet{{")?;
        let mut first = true;
        for b in 0..=255u8 {
            if self.is_bad(b) {
                if !first {
                    write!(f, ", ")?;
                }
                write!(f, "{:#04x}", b)?;
                first = false;
            }
        }
        write!(f, "}}")
    }
}
