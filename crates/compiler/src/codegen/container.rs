//! ELF64 executable synthesis for the `x86_64-unknown-linux-gnu` target
//! (`spec.md §4.7`, §6.3): a real dynamically-linked image — `PT_INTERP`,
//! a `PT_DYNAMIC` segment with `DT_NEEDED` for every shared library the
//! program actually calls into, a `.dynsym`/`.dynstr`/`.hash` symbol
//! table, and a lazily-bound `.plt`/`.got.plt` pair with
//! `R_X86_64_JUMP_SLOT` relocations — built by hand, the same way `ld`
//! would, since no external linker runs anywhere in this pipeline.
//!
//! Layout, in address order:
//!
//! ```text
//! BASE_VADDR  ehdr, phdrs, PT_INTERP string, .hash, .dynsym, .dynstr,
//!             .rela.plt, .plt                              (R+X)
//!             .text                                        (R+X)
//! page-aligned .got.plt, .dynamic                           (R+W)
//!             .rodata (float/list/map/string constants, the CPUID
//!             flag, memoization slots, the hot-function table, the
//!             arena-bookkeeping triples — mixed read-only and
//!             runtime-mutable entries, per `rodata.rs`'s own doc
//!             comment; kept in one R+W segment rather than split,
//!             a recorded simplification over a real linker's R vs
//!             R+W section split)                            (R+W)
//! ```
//!
//! No section header table is written (`e_shoff = 0`): `ld.so` and the
//! kernel ELF loader only ever consult program headers at load time: a
//! section header table exists purely for tooling like `objdump`, which
//! this compiler doesn't need to satisfy.
//!
//! PLT/GOT resolution is the standard lazy-binding scheme: each call site
//! in `.text` calls a `.plt` stub, which jumps through its `.got.plt`
//! slot. Before the first call, that slot still holds the address of the
//! stub's own "push relocation index; jump to PLT0" tail, so the first
//! call falls through to `PLT0`, which jumps into the dynamic linker's
//! resolver (`ld.so` fills in `.got.plt[1]`/`.got.plt[2]` at load time);
//! every later call goes straight through the now-patched slot.

use std::collections::HashMap;

use crate::error::ContainerError;

/// Non-PIE x86-64 ELF base virtual address — matches the classic
/// `ld`-default load address, chosen so the emitted binary needs no
/// `R_X86_64_RELATIVE` self-relocations at all.
pub const BASE_VADDR: u64 = 0x400000;

const EHDR_SIZE: u64 = 64;
const PHDR_SIZE: u64 = 56;
const PHDR_COUNT: u64 = 5; // PT_PHDR, PT_INTERP, 2x PT_LOAD, PT_DYNAMIC
const PHDRS_END: u64 = EHDR_SIZE + PHDR_COUNT * PHDR_SIZE;

const INTERP: &[u8] = b"/lib64/ld-linux-x86-64.so.2\0";

const DT_NEEDED: i64 = 1;
const DT_PLTRELSZ: i64 = 2;
const DT_PLTGOT: i64 = 3;
const DT_HASH: i64 = 4;
const DT_STRTAB: i64 = 5;
const DT_SYMTAB: i64 = 6;
const DT_STRSZ: i64 = 10;
const DT_SYMENT: i64 = 11;
const DT_PLTREL: i64 = 20;
const DT_JMPREL: i64 = 23;
const DT_NULL: i64 = 0;
const DT_RELA: i64 = 7;

const R_X86_64_JUMP_SLOT: u64 = 7;
const STB_GLOBAL_STT_FUNC: u8 = (1 << 4) | 2;

fn align_up(v: u64, align: u64) -> u64 {
    v.div_ceil(align) * align
}

/// `DT_HASH`'s `SysV` hash function (ELF gABI §"Hash Table").
fn elf_hash(name: &[u8]) -> u32 {
    let mut h: u32 = 0;
    for &b in name {
        h = (h << 4).wrapping_add(b as u32);
        let g = h & 0xf000_0000;
        if g != 0 {
            h ^= g >> 24;
        }
        h &= !g;
    }
    h
}

/// A growing string table that hands back each inserted name's byte
/// offset, with the mandatory leading NUL (`STN_UNDEF`/empty-string
/// convention every `st_name`/`DT_NEEDED` index can point at).
struct StrTab {
    bytes: Vec<u8>,
}

impl StrTab {
    fn new() -> Self {
        StrTab { bytes: vec![0u8] }
    }

    fn insert(&mut self, name: &str) -> u32 {
        let offset = self.bytes.len() as u32;
        self.bytes.extend_from_slice(name.as_bytes());
        self.bytes.push(0);
        offset
    }
}

/// Everything about the dynamic-linking metadata whose *address* (not
/// contents) is fixed before a single instruction of `.text` is emitted:
/// its size depends only on how many distinct external symbols and
/// needed libraries the program references, never on how much code
/// calls them. [`crate::codegen::driver`] builds one of these before
/// compiling the program's body, so every `call` site can be patched to
/// its PLT stub's address as soon as it's emitted, exactly as
/// `spec.md §4.8`'s two-pass discipline expects every other forward
/// reference to work.
pub struct PltPlan {
    pub text_vaddr: u64,
    plt_vaddr: u64,
    symbol_order: Vec<String>,
    symbol_index: HashMap<String, usize>,
    needed_libs: Vec<String>,

    interp_vaddr: u64,
    hash_vaddr: u64,
    hash_bytes: Vec<u8>,
    dynsym_vaddr: u64,
    dynsym_bytes: Vec<u8>,
    dynstr_vaddr: u64,
    dynstr_bytes: Vec<u8>,
    lib_name_offset: HashMap<String, u32>,
    rela_plt_vaddr: u64,
}

impl PltPlan {
    /// Lay out every pre-`.text` section from just the symbol/library
    /// *names* (`spec.md §4.7`: "every required shared library ...
    /// nothing more"). `needed_libs` must already contain `"libc.so.6"`
    /// (always required) and `"libm.so.6"` (only if `**`/a libm FFI call
    /// appears) — `FlapCompiler::new` seeds the former.
    pub fn new(external_symbols: &[String], needed_libs: &[String]) -> Self {
        let n = external_symbols.len();

        let mut dynstr = StrTab::new();
        let mut lib_name_offset = HashMap::new();
        for lib in needed_libs {
            lib_name_offset.insert(lib.clone(), dynstr.insert(lib));
        }
        let mut symbol_index = HashMap::new();
        let mut sym_name_offsets = Vec::with_capacity(n);
        for (i, sym) in external_symbols.iter().enumerate() {
            symbol_index.insert(sym.clone(), i);
            sym_name_offsets.push(dynstr.insert(sym));
        }

        // .dynsym: index 0 is the mandatory all-zero null symbol.
        let mut dynsym_bytes = vec![0u8; 24];
        for &name_off in &sym_name_offsets {
            dynsym_bytes.extend_from_slice(&name_off.to_le_bytes()); // st_name
            dynsym_bytes.push(STB_GLOBAL_STT_FUNC); // st_info
            dynsym_bytes.push(0); // st_other
            dynsym_bytes.extend_from_slice(&0u16.to_le_bytes()); // st_shndx = SHN_UNDEF
            dynsym_bytes.extend_from_slice(&0u64.to_le_bytes()); // st_value
            dynsym_bytes.extend_from_slice(&0u64.to_le_bytes()); // st_size
        }

        // .hash: classic SysV layout, one bucket per symbol (not tuned
        // for lookup speed — correctness is all `ld.so` requires).
        let nchain = (n + 1) as u32;
        let nbucket = n.max(1) as u32;
        let mut buckets = vec![0u32; nbucket as usize];
        let mut chains = vec![0u32; nchain as usize];
        for (i, sym) in external_symbols.iter().enumerate() {
            let sym_index = (i + 1) as u32;
            let slot = elf_hash(sym.as_bytes()) % nbucket;
            chains[sym_index as usize] = buckets[slot as usize];
            buckets[slot as usize] = sym_index;
        }
        let mut hash_bytes = Vec::with_capacity(8 + 4 * (nbucket + nchain) as usize);
        hash_bytes.extend_from_slice(&nbucket.to_le_bytes());
        hash_bytes.extend_from_slice(&nchain.to_le_bytes());
        for b in &buckets {
            hash_bytes.extend_from_slice(&b.to_le_bytes());
        }
        for c in &chains {
            hash_bytes.extend_from_slice(&c.to_le_bytes());
        }

        let interp_vaddr = BASE_VADDR + PHDRS_END;
        let hash_vaddr = align_up(interp_vaddr + INTERP.len() as u64, 8);
        let dynsym_vaddr = hash_vaddr + hash_bytes.len() as u64;
        let dynstr_vaddr = dynsym_vaddr + dynsym_bytes.len() as u64;
        let rela_plt_vaddr = dynstr_vaddr + dynstr.bytes.len() as u64;
        let rela_plt_len = 24 * n as u64;
        let plt_vaddr = align_up(rela_plt_vaddr + rela_plt_len, 16);
        let text_vaddr = plt_vaddr + 16 * (n as u64 + 1);

        PltPlan {
            text_vaddr,
            plt_vaddr,
            symbol_order: external_symbols.to_vec(),
            symbol_index,
            needed_libs: needed_libs.to_vec(),
            interp_vaddr,
            hash_vaddr,
            hash_bytes,
            dynsym_vaddr,
            dynsym_bytes,
            dynstr_vaddr,
            dynstr_bytes: dynstr.bytes,
            lib_name_offset,
            rela_plt_vaddr,
        }
    }

    /// The address of the `.plt` stub a `call rel32` to `symbol` should
    /// target — the container writer's analogue of "the PLT stub for
    /// this externally-called function" from `spec.md §4.7`.
    pub fn plt_entry_vaddr(&self, symbol: &str) -> Option<u64> {
        self.symbol_index.get(symbol).map(|&i| self.plt_vaddr + 16 * (i as u64 + 1))
    }

    /// Where `.rodata` must start once `text_len` bytes of code follow
    /// `.text`'s base — `.got.plt`/`.dynamic` are interposed between
    /// them (`driver.rs` needs this before it can lay out and render the
    /// rodata table at its final address).
    pub fn rodata_vaddr(&self, text_len: usize) -> u64 {
        let (got_plt_vaddr, dynamic_len) = self.got_plt_and_dynamic_len(text_len);
        align_up(got_plt_vaddr + self.got_plt_len() + dynamic_len, 8)
    }

    fn got_plt_len(&self) -> u64 {
        8 * (3 + self.symbol_order.len() as u64)
    }

    fn got_plt_and_dynamic_len(&self, text_len: usize) -> (u64, u64) {
        let text_end = self.text_vaddr + text_len as u64;
        let got_plt_vaddr = align_up(text_end, 0x1000);
        let dynamic_entry_count = self.needed_libs.len() as u64 + 10; // see build_dynamic
        (got_plt_vaddr, 16 * dynamic_entry_count)
    }

    fn build_plt(&self, got_plt_vaddr: u64) -> Vec<u8> {
        let n = self.symbol_order.len() as u64;
        let mut plt = Vec::with_capacity(16 * (n as usize + 1));

        // PLT0: push *GOT[1]; jmp *GOT[2]; pad.
        let plt0 = self.plt_vaddr;
        push_rip_mem(&mut plt, plt0, got_plt_vaddr + 8);
        jmp_rip_mem(&mut plt, plt0 + 6, got_plt_vaddr + 16);
        plt.extend_from_slice(&[0x0f, 0x1f, 0x40, 0x00]);
        debug_assert_eq!(plt.len(), 16);

        for i in 0..n {
            let base = self.plt_vaddr + 16 * (i + 1);
            let got_slot = got_plt_vaddr + 8 * (3 + i);
            jmp_rip_mem(&mut plt, base, got_slot);
            plt.push(0x68); // push imm32
            plt.extend_from_slice(&(i as u32).to_le_bytes());
            plt.push(0xe9); // jmp rel32
            let next_instr = base + 11 + 5;
            plt.extend_from_slice(&((plt0 as i64) - (next_instr as i64)).to_le_bytes()[0..4]);
            debug_assert_eq!(plt.len(), 16 * (i as usize + 2));
        }
        plt
    }

    fn build_rela_plt(&self, got_plt_vaddr: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(24 * self.symbol_order.len());
        for (i, _sym) in self.symbol_order.iter().enumerate() {
            let got_slot = got_plt_vaddr + 8 * (3 + i as u64);
            let sym_index = (i + 1) as u64; // dynsym index, null symbol is 0
            out.extend_from_slice(&got_slot.to_le_bytes()); // r_offset
            out.extend_from_slice(&((sym_index << 32) | R_X86_64_JUMP_SLOT).to_le_bytes()); // r_info
            out.extend_from_slice(&0i64.to_le_bytes()); // r_addend
        }
        out
    }

    fn build_got_plt(&self, dynamic_vaddr: u64) -> Vec<u8> {
        let n = self.symbol_order.len() as u64;
        let mut out = Vec::with_capacity(8 * (3 + n) as usize);
        out.extend_from_slice(&dynamic_vaddr.to_le_bytes()); // GOT[0]: link to .dynamic
        out.extend_from_slice(&0u64.to_le_bytes()); // GOT[1]: link_map ptr, filled by ld.so
        out.extend_from_slice(&0u64.to_le_bytes()); // GOT[2]: resolver entry, filled by ld.so
        for i in 0..n {
            // Lazy-binding initial target: the `push <reloc-index>` byte
            // inside this symbol's own PLT stub, 6 bytes past its start.
            let stub = self.plt_vaddr + 16 * (i + 1) + 6;
            out.extend_from_slice(&stub.to_le_bytes());
        }
        out
    }

    fn build_dynamic(&self, hash_v: u64, dynstr_v: u64, dynsym_v: u64, got_plt_v: u64, rela_plt_v: u64, rela_plt_len: u64) -> Vec<u8> {
        let mut entries: Vec<(i64, u64)> = Vec::new();
        for lib in &self.needed_libs {
            entries.push((DT_NEEDED, self.lib_name_offset[lib] as u64));
        }
        entries.push((DT_HASH, hash_v));
        entries.push((DT_STRTAB, dynstr_v));
        entries.push((DT_SYMTAB, dynsym_v));
        entries.push((DT_STRSZ, self.dynstr_bytes.len() as u64));
        entries.push((DT_SYMENT, 24));
        entries.push((DT_PLTGOT, got_plt_v));
        entries.push((DT_PLTRELSZ, rela_plt_len));
        entries.push((DT_PLTREL, DT_RELA as u64));
        entries.push((DT_JMPREL, rela_plt_v));
        entries.push((DT_NULL, 0));
        debug_assert_eq!(entries.len() as u64, self.needed_libs.len() as u64 + 10);

        let mut out = Vec::with_capacity(16 * entries.len());
        for (tag, val) in entries {
            out.extend_from_slice(&tag.to_le_bytes());
            out.extend_from_slice(&val.to_le_bytes());
        }
        out
    }
}

/// `push qword [rip + disp32]` (`FF /6` with a RIP-relative `ModRM`),
/// used only by `PLT0`'s first instruction.
fn push_rip_mem(out: &mut Vec<u8>, at: u64, target: u64) {
    out.push(0xff);
    out.push(0x35);
    let next_instr = at + 6;
    out.extend_from_slice(&((target as i64) - (next_instr as i64)).to_le_bytes()[0..4]);
}

/// `jmp qword [rip + disp32]` (`FF /4`), `PLT0`'s second instruction and
/// every `PLTn`'s first.
fn jmp_rip_mem(out: &mut Vec<u8>, at: u64, target: u64) {
    out.push(0xff);
    out.push(0x25);
    let next_instr = at + 6;
    out.extend_from_slice(&((target as i64) - (next_instr as i64)).to_le_bytes()[0..4]);
}

/// The fully laid-out, ready-to-write image: text and rodata bytes with
/// every `call`/`lea rip` site already patched to its final address
/// (patched by [`crate::codegen::driver::compile_program`] before this
/// type is constructed — `container.rs` never edits `.text`/`.rodata`
/// bytes, only frames them alongside the dynamic-linking metadata it
/// owns).
pub struct Layout {
    pub plan: PltPlan,
    pub text: Vec<u8>,
    pub rodata: Vec<u8>,
}

/// Write the complete dynamically-linked ELF64 executable described at
/// the top of this module.
pub fn write_elf(layout: &Layout) -> Result<Vec<u8>, ContainerError> {
    if layout.text.is_empty() {
        return Err(ContainerError::MissingEntryPoint);
    }
    let plan = &layout.plan;
    let (got_plt_vaddr, _dynamic_len) = plan.got_plt_and_dynamic_len(layout.text.len());
    let dynamic_vaddr = got_plt_vaddr + plan.got_plt_len();
    let rela_plt = plan.build_rela_plt(got_plt_vaddr);
    let plt = plan.build_plt(got_plt_vaddr);
    let got_plt = plan.build_got_plt(dynamic_vaddr);
    let dynamic = plan.build_dynamic(
        plan.hash_vaddr,
        plan.dynstr_vaddr,
        plan.dynsym_vaddr,
        got_plt_vaddr,
        plan.rela_plt_vaddr,
        rela_plt.len() as u64,
    );
    let rodata_vaddr = plan.rodata_vaddr(layout.text.len());
    debug_assert_eq!(rodata_vaddr, align_up(dynamic_vaddr + dynamic.len() as u64, 8));

    let seg1_filesz = plan.text_vaddr + layout.text.len() as u64 - BASE_VADDR;
    let seg2_vaddr = got_plt_vaddr;
    let seg2_filesz = rodata_vaddr + layout.rodata.len() as u64 - seg2_vaddr;

    let mut out = Vec::with_capacity((rodata_vaddr - BASE_VADDR) as usize + layout.rodata.len());

    // --- ELF header ---
    out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    out.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    out.extend_from_slice(&0x3eu16.to_le_bytes()); // EM_X86_64
    out.extend_from_slice(&1u32.to_le_bytes()); // EV_CURRENT
    out.extend_from_slice(&plan.text_vaddr.to_le_bytes()); // e_entry: program's own first instruction
    out.extend_from_slice(&EHDR_SIZE.to_le_bytes()); // e_phoff
    out.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
    out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    out.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes()); // e_ehsize
    out.extend_from_slice(&(PHDR_SIZE as u16).to_le_bytes()); // e_phentsize
    out.extend_from_slice(&(PHDR_COUNT as u16).to_le_bytes()); // e_phnum
    out.extend_from_slice(&0u16.to_le_bytes()); // e_shentsize
    out.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
    out.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx
    debug_assert_eq!(out.len() as u64, EHDR_SIZE);

    // --- Program headers ---
    write_phdr(&mut out, 6 /* PT_PHDR */, 4, EHDR_SIZE, BASE_VADDR + EHDR_SIZE, PHDR_COUNT * PHDR_SIZE, 8);
    write_phdr(
        &mut out,
        3, /* PT_INTERP */
        4,
        plan.interp_vaddr - BASE_VADDR,
        plan.interp_vaddr,
        INTERP.len() as u64,
        1,
    );
    write_phdr(&mut out, 1 /* PT_LOAD */, 5 /* R+X */, 0, BASE_VADDR, seg1_filesz, 0x1000);
    write_phdr(&mut out, 1 /* PT_LOAD */, 6 /* R+W */, seg2_vaddr - BASE_VADDR, seg2_vaddr, seg2_filesz, 0x1000);
    write_phdr(
        &mut out,
        2, /* PT_DYNAMIC */
        6,
        dynamic_vaddr - BASE_VADDR,
        dynamic_vaddr,
        dynamic.len() as u64,
        8,
    );
    debug_assert_eq!(out.len() as u64, PHDRS_END);

    // --- Segment 1: PT_INTERP string, .hash, .dynsym, .dynstr, .rela.plt, .plt, .text ---
    out.extend_from_slice(INTERP);
    pad_to(&mut out, plan.hash_vaddr - BASE_VADDR);
    out.extend_from_slice(&plan.hash_bytes);
    debug_assert_eq!(out.len() as u64, plan.dynsym_vaddr - BASE_VADDR);
    out.extend_from_slice(&plan.dynsym_bytes);
    debug_assert_eq!(out.len() as u64, plan.dynstr_vaddr - BASE_VADDR);
    out.extend_from_slice(&plan.dynstr_bytes);
    debug_assert_eq!(out.len() as u64, plan.rela_plt_vaddr - BASE_VADDR);
    out.extend_from_slice(&rela_plt);
    pad_to(&mut out, plan.plt_vaddr - BASE_VADDR);
    out.extend_from_slice(&plt);
    debug_assert_eq!(out.len() as u64, plan.text_vaddr - BASE_VADDR);
    out.extend_from_slice(&layout.text);

    // --- Segment 2: .got.plt, .dynamic, .rodata ---
    pad_to(&mut out, seg2_vaddr - BASE_VADDR);
    out.extend_from_slice(&got_plt);
    debug_assert_eq!(out.len() as u64, dynamic_vaddr - BASE_VADDR);
    out.extend_from_slice(&dynamic);
    pad_to(&mut out, rodata_vaddr - BASE_VADDR);
    out.extend_from_slice(&layout.rodata);

    Ok(out)
}

fn pad_to(out: &mut Vec<u8>, file_offset: u64) {
    while (out.len() as u64) < file_offset {
        out.push(0);
    }
}

#[allow(clippy::too_many_arguments)]
fn write_phdr(out: &mut Vec<u8>, p_type: u32, p_flags: u32, p_offset: u64, p_vaddr: u64, p_size: u64, p_align: u64) {
    out.extend_from_slice(&p_type.to_le_bytes());
    out.extend_from_slice(&p_flags.to_le_bytes());
    out.extend_from_slice(&p_offset.to_le_bytes());
    out.extend_from_slice(&p_vaddr.to_le_bytes());
    out.extend_from_slice(&p_vaddr.to_le_bytes()); // p_paddr, unused under Linux
    out.extend_from_slice(&p_size.to_le_bytes()); // p_filesz
    out.extend_from_slice(&p_size.to_le_bytes()); // p_memsz
    out.extend_from_slice(&p_align.to_le_bytes());
}

/// Write a `--keep-asm` textual dump of the emitted machine code as a
/// flat byte listing with offset annotations, for debugging a
/// miscompile without a disassembler on hand (`spec.md` §A's CLI flag).
/// Not a real assembly syntax — this compiler never produces or
/// consumes assembly text anywhere in its own pipeline; the dump exists
/// purely as an eyeball-diffable artifact.
pub fn dump_text_bytes(text: &[u8], labels: &HashMap<usize, String>) -> String {
    let mut out = String::new();
    for (offset, chunk) in text.chunks(16).enumerate() {
        let base = offset * 16;
        if let Some(label) = labels.get(&base) {
            out.push_str(&format!("{label}:\n"));
        }
        out.push_str(&format!("  {base:06x}: "));
        for b in chunk {
            out.push_str(&format!("{b:02x} "));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elf_hash_matches_the_gabi_worked_example() {
        // The ELF gABI spec's own worked example for this function.
        assert_eq!(elf_hash(b"main"), 0x737fe);
    }

    #[test]
    fn plt_plan_places_text_after_every_pre_text_symbol_table_section() {
        let plan = PltPlan::new(&["malloc".to_string(), "write".to_string()], &["libc.so.6".to_string()]);
        assert!(plan.interp_vaddr > BASE_VADDR);
        assert!(plan.hash_vaddr > plan.interp_vaddr);
        assert!(plan.dynsym_vaddr > plan.hash_vaddr);
        assert!(plan.dynstr_vaddr > plan.dynsym_vaddr);
        assert!(plan.rela_plt_vaddr > plan.dynstr_vaddr);
        assert!(plan.plt_vaddr > plan.rela_plt_vaddr);
        assert!(plan.text_vaddr > plan.plt_vaddr);
        assert_eq!(plan.text_vaddr - plan.plt_vaddr, 16 * 3); // PLT0 + 2 symbols
    }

    #[test]
    fn plt_entry_vaddr_is_stable_and_distinct_per_symbol() {
        let plan = PltPlan::new(&["malloc".to_string(), "write".to_string()], &["libc.so.6".to_string()]);
        let a = plan.plt_entry_vaddr("malloc").unwrap();
        let b = plan.plt_entry_vaddr("write").unwrap();
        assert_ne!(a, b);
        assert_eq!(plan.plt_entry_vaddr("nonexistent"), None);
    }

    #[test]
    fn empty_symbol_table_still_produces_a_valid_plan() {
        let plan = PltPlan::new(&[], &["libc.so.6".to_string()]);
        assert_eq!(plan.text_vaddr - plan.plt_vaddr, 16); // PLT0 only
    }

    #[test]
    fn write_elf_round_trips_a_minimal_program() {
        let plan = PltPlan::new(&[], &["libc.so.6".to_string()]);
        let text = vec![0xb8, 0x3c, 0, 0, 0, 0x0f, 0x05]; // mov eax, 60; syscall
        let rodata_vaddr = plan.rodata_vaddr(text.len());
        let layout = Layout { plan, text, rodata: vec![1, 2, 3, 4] };
        let bytes = write_elf(&layout).unwrap();
        assert_eq!(&bytes[0..4], &[0x7f, b'E', b'L', b'F']);
        assert_eq!(bytes.len() as u64, rodata_vaddr - BASE_VADDR + 4);
    }
}
