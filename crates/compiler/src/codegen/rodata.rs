//! The rodata table: every constant the emitted program needs a stable
//! address for — float literals, list/map/string literals, non-capturing
//! closure objects, the hot-function table, the CPUID flag, memoization
//! slots — kept in a single insertion-ordered table rather than a
//! `HashMap` so the two-pass driver's output is byte-identical across
//! runs (`spec.md §8` property 1, `spec.md §4.7`'s "deterministic
//! lambda enumeration" requirement extended to rodata).
//!
//! Strictly speaking not all of this is read-only once the program is
//! running — `spec.md §9`'s "global mutable process state" note calls out
//! the meta-arena, memoization caches, the CPUID flag, and the
//! hot-function table as rodata-*shaped* but runtime-mutable. This table
//! doesn't distinguish the two, and neither does the container writer:
//! every entry lands in the same R+W segment, [`RodataEntry::mutable`]
//! is carried for documentation purposes only.

use std::collections::HashMap;

/// A handle into the table, stable across both compilation passes as
/// long as the same sequence of `intern_*`/`reserve_*` calls is replayed
/// (which the two-pass driver guarantees by resetting and recompiling
/// from scratch rather than mutating in place).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RodataRef(pub usize);

#[derive(Debug, Clone)]
pub struct RodataEntry {
    pub label: String,
    pub bytes: Vec<u8>,
    pub align: usize,
    pub mutable: bool,
}

#[derive(Debug, Default)]
pub struct RodataTable {
    entries: Vec<RodataEntry>,
    dedup: HashMap<String, usize>,
    next_id: u64,
}

impl RodataTable {
    pub fn new() -> Self {
        RodataTable::default()
    }

    fn fresh_label(&mut self, prefix: &str) -> String {
        let id = self.next_id;
        self.next_id += 1;
        format!("{prefix}_{id}")
    }

    fn push(&mut self, label: String, bytes: Vec<u8>, align: usize, mutable: bool) -> RodataRef {
        let idx = self.entries.len();
        self.entries.push(RodataEntry { label, bytes, align, mutable });
        RodataRef(idx)
    }

    /// A deduplicated `f64` constant (fractional-literal storage, per
    /// `spec.md §4.5`'s Number lowering, plus the `-1.0` unary-negation
    /// constant and similar compiler-generated doubles).
    pub fn intern_f64(&mut self, value: f64) -> RodataRef {
        let key = format!("f64:{:016x}", value.to_bits());
        if let Some(&idx) = self.dedup.get(&key) {
            return RodataRef(idx);
        }
        let label = self.fresh_label("flt");
        let r = self.push(label, value.to_le_bytes().to_vec(), 8, false);
        self.dedup.insert(key, r.0);
        r
    }

    /// A null-terminated C string, deduplicated by content — used for
    /// `cstr` casts, FFI string arguments, and runtime-guard error
    /// messages (`spec.md §4.5`'s division-by-zero / `or!` preambles).
    pub fn intern_cstr(&mut self, s: &str) -> RodataRef {
        let key = format!("cstr:{s}");
        if let Some(&idx) = self.dedup.get(&key) {
            return RodataRef(idx);
        }
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        let label = self.fresh_label("cstr");
        let r = self.push(label, bytes, 1, false);
        self.dedup.insert(key, r.0);
        r
    }

    /// A Flap string: an 8-byte element count followed by one `f64`
    /// codepoint per character. Labels beginning `str_` are 8-byte
    /// aligned per `spec.md §4.7`'s rodata layout discipline so the
    /// leading count field lands on an aligned address.
    pub fn intern_flap_string(&mut self, codepoints: &[u32]) -> RodataRef {
        let mut bytes = Vec::with_capacity(8 + codepoints.len() * 8);
        bytes.extend_from_slice(&(codepoints.len() as f64).to_le_bytes());
        for cp in codepoints {
            bytes.extend_from_slice(&(*cp as f64).to_le_bytes());
        }
        let label = self.fresh_label("str_lit");
        self.push(label, bytes, 8, false)
    }

    /// A Flap list literal: count followed by element `f64`s.
    pub fn intern_list(&mut self, elements: &[f64]) -> RodataRef {
        let mut bytes = Vec::with_capacity(8 + elements.len() * 8);
        bytes.extend_from_slice(&(elements.len() as f64).to_le_bytes());
        for e in elements {
            bytes.extend_from_slice(&e.to_le_bytes());
        }
        let label = self.fresh_label("list_lit");
        self.push(label, bytes, 8, false)
    }

    /// A Flap map literal: `[count][key0][val0][key1][val1]...`, both
    /// keys and values stored as raw `f64` bit patterns (identifier keys
    /// are pre-hashed by the caller per `spec.md §4.5`).
    pub fn intern_map(&mut self, pairs: &[(f64, f64)]) -> RodataRef {
        let mut bytes = Vec::with_capacity(8 + pairs.len() * 16);
        bytes.extend_from_slice(&(pairs.len() as f64).to_le_bytes());
        for (k, v) in pairs {
            bytes.extend_from_slice(&k.to_le_bytes());
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let label = self.fresh_label("map_lit");
        self.push(label, bytes, 8, false)
    }

    /// A static 16-byte closure object `[fn_ptr][null_env]` for a
    /// non-capturing lambda. The function-pointer half is a placeholder
    /// until pass 2 knows the lambda's text offset; the caller patches it
    /// via [`RodataTable::patch_u64`].
    pub fn reserve_static_closure(&mut self, name_hint: &str) -> RodataRef {
        let label = self.fresh_label(&format!("closure_{name_hint}"));
        self.push(label, vec![0u8; 16], 8, false)
    }

    /// One mutable byte, initialized at program start by the CPUID probe.
    pub fn reserve_cpuid_flag(&mut self) -> RodataRef {
        let label = self.fresh_label("cpuid_flag");
        self.push(label, vec![0u8], 1, true)
    }

    /// An `N`-entry hot-function table: one 8-byte closure-object pointer
    /// slot per `hot`-bound lambda, overwritten once at compile
    /// finalization and read (never written) at runtime.
    pub fn reserve_hot_table(&mut self, count: usize) -> RodataRef {
        let label = self.fresh_label("hot_table");
        self.push(label, vec![0u8; count * 8], 8, true)
    }

    /// An 8-byte memoization-cache slot for a pure lambda: holds the
    /// cached argument/result pair's presence flag plus the cached
    /// value, laid out by the caller.
    pub fn reserve_memo_slot(&mut self, lambda_name: &str, bytes: usize) -> RodataRef {
        let label = self.fresh_label(&format!("memo_{lambda_name}"));
        self.push(label, vec![0u8; bytes], 8, true)
    }

    /// A per-depth meta-arena slot: `[base_ptr][capacity][offset]`,
    /// 24 bytes, mutable.
    pub fn reserve_arena_slot(&mut self, depth: u32) -> RodataRef {
        let label = self.fresh_label(&format!("arena_{depth}"));
        self.push(label, vec![0u8; 24], 8, true)
    }

    pub fn patch_u64(&mut self, r: RodataRef, offset: usize, value: u64) {
        self.entries[r.0].bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    pub fn entries(&self) -> &[RodataEntry] {
        &self.entries
    }

    /// Lay the table out starting at `base`, honoring each entry's
    /// alignment, and return each entry's resulting address alongside
    /// the total footprint.
    pub fn layout(&self, base: usize) -> (Vec<usize>, usize) {
        let mut addrs = Vec::with_capacity(self.entries.len());
        let mut cursor = base;
        for entry in &self.entries {
            if entry.align > 1 {
                cursor = cursor.div_ceil(entry.align) * entry.align;
            }
            addrs.push(cursor);
            cursor += entry.bytes.len();
        }
        (addrs, cursor - base)
    }

    /// Render the table as one contiguous byte blob, padded between
    /// entries exactly as [`RodataTable::layout`] computes their
    /// addresses, so the driver can lay the returned bytes down at
    /// `base` in the final container image.
    pub fn to_bytes(&self, base: usize) -> Vec<u8> {
        let (addrs, total) = self.layout(base);
        let mut out = vec![0u8; total];
        for (entry, addr) in self.entries.iter().zip(addrs) {
            let start = addr - base;
            out[start..start + entry.bytes.len()].copy_from_slice(&entry.bytes);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_the_same_float_twice_returns_the_same_ref() {
        let mut table = RodataTable::new();
        let a = table.intern_f64(3.5);
        let b = table.intern_f64(3.5);
        assert_eq!(a, b);
        assert_eq!(table.entries().len(), 1);
    }

    #[test]
    fn distinct_floats_get_distinct_refs() {
        let mut table = RodataTable::new();
        let a = table.intern_f64(1.0);
        let b = table.intern_f64(2.0);
        assert_ne!(a, b);
    }

    #[test]
    fn layout_respects_eight_byte_alignment_for_string_literals() {
        let mut table = RodataTable::new();
        table.intern_cstr("x"); // 1-byte aligned, 2 bytes
        table.intern_flap_string(&[65]); // 8-byte aligned
        let (addrs, _total) = table.layout(0x1000);
        assert_eq!(addrs[1] % 8, 0);
    }

    #[test]
    fn to_bytes_places_each_entry_at_its_layout_address() {
        let mut table = RodataTable::new();
        let a = table.intern_cstr("hi");
        let b = table.intern_f64(2.5);
        let (addrs, total) = table.layout(0x2000);
        let bytes = table.to_bytes(0x2000);
        assert_eq!(bytes.len(), total);
        let a_off = addrs[a.0] - 0x2000;
        let b_off = addrs[b.0] - 0x2000;
        assert_eq!(&bytes[a_off..a_off + 3], b"hi\0");
        assert_eq!(&bytes[b_off..b_off + 8], &2.5f64.to_le_bytes());
    }
}
