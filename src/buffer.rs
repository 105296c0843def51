//! Output buffer, rewrite records, and relocation sites.
//!
//! The buffer is a plain growable byte vector with the little-endian `put`
//! primitives of a code sink plus the overwrite and truncate operations the
//! driver needs to revert a failed strategy emission.

use crate::inst::DecodedInst;

/// Offset in bytes from the beginning of the produced output.
///
/// The engine can rewrite blobs for a foreign target, so this is a fixed
/// 32-bit type rather than `usize`.
pub type CodeOffset = u32;

/// Growable byte buffer holding the rewritten output of one job.
#[derive(Clone, Debug, Default)]
pub struct OutputBuffer {
    data: Vec<u8>,
}

impl OutputBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a buffer with room for `cap` bytes.
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            data: Vec::with_capacity(cap),
        }
    }

    /// Current append position.
    #[inline]
    pub fn cur_offset(&self) -> CodeOffset {
        self.data.len() as CodeOffset
    }

    /// Append 1 byte.
    #[inline]
    pub fn put1(&mut self, v: u8) {
        self.data.push(v);
    }

    /// Append 2 bytes, little-endian.
    #[inline]
    pub fn put2(&mut self, v: u16) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    /// Append 4 bytes, little-endian.
    #[inline]
    pub fn put4(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    /// Append 8 bytes, little-endian.
    #[inline]
    pub fn put8(&mut self, v: u64) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    /// Append a byte slice.
    #[inline]
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Overwrite bytes starting at `offset`; the range must already exist.
    pub fn patch(&mut self, offset: CodeOffset, bytes: &[u8]) {
        let start = offset as usize;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
    }

    /// Discard everything at and after `offset`.
    pub fn truncate(&mut self, offset: CodeOffset) {
        self.data.truncate(offset as usize);
    }

    /// The bytes appended since `offset`.
    pub fn slice_from(&self, offset: CodeOffset) -> &[u8] {
        &self.data[offset as usize..]
    }

    /// All bytes produced so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Number of bytes produced so far.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when nothing has been emitted.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Consume the buffer, yielding the output bytes.
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

/// Bookkeeping for one processed instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RewriteRecord {
    /// Address of the instruction in the original input.
    pub old_address: u64,
    /// Encoded size in the original input.
    pub old_size: u32,
    /// Where the replacement starts in the output.
    pub new_offset: CodeOffset,
    /// Size of the replacement in bytes.
    pub new_size: u32,
    /// Name of the strategy (or built-in form) that produced the bytes.
    pub strategy: &'static str,
}

/// The displacement field shape at a relocation site.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SiteKind {
    /// x86 8-bit relative displacement; `offset` points at the byte.
    X86Rel8,
    /// x86 32-bit relative displacement; `offset` points at the low byte.
    X86Rel32,
    /// x64 RIP-relative 32-bit displacement followed by `tail` trailing
    /// instruction bytes (an immediate operand, if any).
    X86RipDisp32 {
        /// Bytes between the end of the displacement field and the end of
        /// the instruction.
        tail: u8,
    },
    /// ARM32 B/BL word; `offset` points at the instruction word.
    A32Branch24,
    /// AArch64 B/BL word with a 26-bit offset field.
    A64Branch26,
    /// AArch64 B.cond/CBZ/CBNZ word with a 19-bit offset field.
    A64Branch19,
    /// AArch64 TBZ/TBNZ word with a 14-bit offset field.
    A64Branch14,
}

/// A position in the output whose bytes encode a displacement that must
/// resolve against the final address map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelocSite {
    /// Index of the owning instruction in the job's instruction array.
    pub inst_index: usize,
    /// Output offset of the displacement field (or instruction word).
    pub offset: CodeOffset,
    /// Field shape.
    pub kind: SiteKind,
    /// Target address in the original input.
    pub target: u64,
}

/// Total map from original instruction addresses to output offsets.
///
/// Entries are kept in ascending address order; lookup is a binary search.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct AddressMap {
    entries: Vec<(u64, CodeOffset)>,
}

impl AddressMap {
    /// The identity layout: every instruction keeps its original offset.
    pub fn identity(insts: &[DecodedInst], base: u64) -> Self {
        let entries = insts
            .iter()
            .map(|i| (i.address, (i.address - base) as CodeOffset))
            .collect();
        Self { entries }
    }

    /// Build the map recorded by an emission pass.
    pub fn from_records(records: &[RewriteRecord]) -> Self {
        let entries = records
            .iter()
            .map(|r| (r.old_address, r.new_offset))
            .collect();
        Self { entries }
    }

    /// New output offset of the instruction that started at `old`, if `old`
    /// is an instruction start address.
    pub fn lookup(&self, old: u64) -> Option<CodeOffset> {
        self.entries
            .binary_search_by_key(&old, |&(a, _)| a)
            .ok()
            .map(|i| self.entries[i].1)
    }

    /// Number of mapped instructions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no instruction is mapped.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_primitives_are_little_endian() {
        let mut buf = OutputBuffer::new();
        buf.put1(0x01);
        buf.put2(0x0302);
        buf.put4(0x0706_0504);
        assert_eq!(buf.as_slice(), &[1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(buf.cur_offset(), 7);
    }

    #[test]
    fn patch_and_truncate() {
        let mut buf = OutputBuffer::new();
        buf.put_bytes(&[0xaa; 8]);
        buf.patch(2, &[0x11, 0x22]);
        assert_eq!(buf.as_slice()[2], 0x11);
        assert_eq!(buf.as_slice()[3], 0x22);
        buf.truncate(4);
        assert_eq!(buf.len(), 4);
        assert_eq!(buf.slice_from(2), &[0x11, 0x22]);
    }

    #[test]
    fn address_map_lookup() {
        let records = vec![
            RewriteRecord {
                old_address: 0x1000,
                old_size: 5,
                new_offset: 0,
                new_size: 2,
                strategy: "a",
            },
            RewriteRecord {
                old_address: 0x1005,
                old_size: 2,
                new_offset: 2,
                new_size: 2,
                strategy: "b",
            },
        ];
        let map = AddressMap::from_records(&records);
        assert_eq!(map.lookup(0x1000), Some(0));
        assert_eq!(map.lookup(0x1005), Some(2));
        assert_eq!(map.lookup(0x1002), None);
    }
}
