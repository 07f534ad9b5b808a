//! ELF64/AArch64 loading: PIE rebasing, segment mapping, symbol and import
//! harvesting, PLT address synthesis, dynamic relocations and entry-point
//! selection.

use anyhow::{Context, Result, bail};
use goblin::elf::Elf;
use goblin::elf::header::EM_AARCH64;
use goblin::elf::program_header::PT_LOAD;
use log::debug;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::vtable::{self, VTableMap};
use super::{Emulator, LIBC_BASE, CTYPE_TABLE_OFFSET, TLS_BASE};

#[cfg(test)]
mod tests;

// AArch64 dynamic relocation types.
pub const R_AARCH64_ABS64: u32 = 257;
pub const R_AARCH64_GLOB_DAT: u32 = 1025;
pub const R_AARCH64_JUMP_SLOT: u32 = 1026;
pub const R_AARCH64_RELATIVE: u32 = 1027;

/// Default rebase target for position-independent objects.
pub const LOAD_ELF_BASE: u64 = 0x4000_0000;

const PLT_HEADER_SIZE: u64 = 32;
const PLT_ENTRY_SIZE: u64 = 16;

/// A loadable segment as mapped into the emulator.
pub struct Segment {
    pub vaddr: u64,
    pub paddr: u64,
    pub offset: u64,
    pub file_size: u64,
    pub mem_size: u64,
    pub flags: u32,
    pub data: Vec<u8>,
}

impl Segment {
    pub fn is_executable(&self) -> bool {
        self.flags & goblin::elf::program_header::PF_X != 0
    }

    pub fn is_writable(&self) -> bool {
        self.flags & goblin::elf::program_header::PF_W != 0
    }
}

/// Parsed metadata for a loaded binary. All addresses are rebased.
pub struct ElfInfo {
    pub path: PathBuf,
    pub entry: u64,
    /// Symbol name to rebased address, dynamic and static tables merged,
    /// version suffixes also aliased stripped.
    pub symbols: HashMap<String, u64>,
    /// External imports to their PLT entry address.
    pub imports: HashMap<String, u64>,
    pub segments: Vec<Segment>,
    pub base_addr: u64,
    pub end_addr: u64,
    pub vtables: VTableMap,
}

/// Drops `@@VERSION` / `@VERSION` suffixes.
pub fn strip_version(name: &str) -> &str {
    match name.find('@') {
        Some(idx) => &name[..idx],
        None => name,
    }
}

impl Emulator {
    /// Loads an ELF and maps it, auto-selecting the base address.
    pub fn load_elf(&mut self, path: &Path) -> Result<ElfInfo> {
        self.load_elf_at(path, 0)
    }

    /// Loads an ELF at an explicit base (0 selects automatically: files whose
    /// lowest PT_LOAD vaddr is below 0x10000 are rebased to `LOAD_ELF_BASE`,
    /// anything else is mapped in place).
    pub fn load_elf_at(&mut self, path: &Path, load_base: u64) -> Result<ElfInfo> {
        let data = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let elf = Elf::parse(&data).context("ELF parse")?;

        if elf.header.e_machine != EM_AARCH64 {
            bail!(
                "expected ARM64 (EM_AARCH64), got machine 0x{:x}",
                elf.header.e_machine
            );
        }

        let mut file_base = u64::MAX;
        let mut file_end = 0u64;
        for ph in &elf.program_headers {
            if ph.p_type != PT_LOAD {
                continue;
            }
            file_base = file_base.min(ph.p_vaddr);
            file_end = file_end.max(ph.p_vaddr + ph.p_memsz);
        }
        if file_base == u64::MAX {
            bail!("no PT_LOAD segments found");
        }

        let reloc_offset = if load_base != 0 {
            load_base.wrapping_sub(file_base)
        } else if file_base < 0x10000 {
            LOAD_ELF_BASE - file_base
        } else {
            0
        };

        let mut info = ElfInfo {
            path: path.to_path_buf(),
            entry: elf.entry.wrapping_add(reloc_offset),
            symbols: HashMap::new(),
            imports: HashMap::new(),
            segments: Vec::new(),
            base_addr: file_base.wrapping_add(reloc_offset),
            end_addr: file_end.wrapping_add(reloc_offset),
            vtables: VTableMap::default(),
        };

        collect_symbols(&elf, reloc_offset, &mut info.symbols);

        for ph in &elf.program_headers {
            if ph.p_type != PT_LOAD {
                continue;
            }
            let load_vaddr = ph.p_vaddr.wrapping_add(reloc_offset);

            let seg_data = if ph.p_filesz > 0
                && (ph.p_offset + ph.p_filesz) as usize <= data.len()
            {
                data[ph.p_offset as usize..(ph.p_offset + ph.p_filesz) as usize].to_vec()
            } else {
                Vec::new()
            };

            // Page-aligned mapping; overlap with an earlier segment or a
            // fixed region is expected and ignored.
            let aligned = load_vaddr & !0xfff;
            let aligned_end = (load_vaddr + ph.p_memsz + 0xfff) & !0xfff;
            let _ = self.map_region(aligned, aligned_end - aligned);

            if !seg_data.is_empty() {
                self.mem_write(load_vaddr, &seg_data)
                    .with_context(|| format!("write segment at 0x{load_vaddr:x}"))?;
            }

            if ph.p_memsz > ph.p_filesz {
                let bss = vec![0u8; (ph.p_memsz - ph.p_filesz) as usize];
                let _ = self.mem_write(load_vaddr + ph.p_filesz, &bss);
            }

            info.segments.push(Segment {
                vaddr: load_vaddr,
                paddr: ph.p_paddr.wrapping_add(reloc_offset),
                offset: ph.p_offset,
                file_size: ph.p_filesz,
                mem_size: ph.p_memsz,
                flags: ph.p_flags,
                data: seg_data,
            });
        }

        // PLT addresses first; ABS64 relocations against externals resolve
        // through them.
        add_plt_symbols(&elf, reloc_offset, &mut info.symbols, &mut info.imports);

        self.apply_relocations(&elf, reloc_offset, &info.imports)
            .context("apply relocations")?;

        info.vtables = vtable::build_vtable_map(&elf, reloc_offset);

        self.init_string_globals(&info.symbols);

        debug!(
            "loaded {} base=0x{:x} end=0x{:x} symbols={} imports={}",
            path.display(),
            info.base_addr,
            info.end_addr,
            info.symbols.len(),
            info.imports.len()
        );

        Ok(info)
    }

    fn apply_relocations(
        &mut self,
        elf: &Elf,
        reloc_offset: u64,
        imports: &HashMap<String, u64>,
    ) -> Result<()> {
        let relocs = elf.dynrelas.iter().chain(elf.pltrelocs.iter());
        for reloc in relocs {
            let target = reloc.r_offset.wrapping_add(reloc_offset);
            let addend = reloc.r_addend.unwrap_or(0);

            let sym = elf.dynsyms.get(reloc.r_sym);
            let sym_value = sym.as_ref().map(|s| s.st_value).unwrap_or(0);
            let sym_name = sym
                .as_ref()
                .and_then(|s| elf.dynstrtab.get_at(s.st_name))
                .unwrap_or("");

            if let Some(resolved) =
                resolve_dyn_reloc(reloc.r_type, sym_value, sym_name, addend, reloc_offset, imports)
            {
                let _ = self.mem_write_u64(target, resolved);
            }
        }
        Ok(())
    }

    /// Points zeroed, commonly-uninitialized `std::string` globals at the
    /// shared empty-string data. Obfuscated Cocos2d-x binaries are full of
    /// single-letter globals the COW string code dereferences blindly.
    fn init_string_globals(&mut self, symbols: &HashMap<String, u64>) {
        let empty = self.get_empty_string_data();
        if empty == 0 {
            return;
        }

        let mut names: Vec<String> = Vec::new();
        for c in b'a'..=b'z' {
            names.push((c as char).to_string());
        }
        for c in b'A'..=b'Z' {
            names.push((c as char).to_string());
        }
        for n in ["a1", "b1", "c1", "d1", "e1", "AS", "TR", "co", "CO"] {
            names.push(n.to_string());
        }

        for name in &names {
            let Some(&addr) = symbols.get(name) else {
                continue;
            };
            if addr == 0 {
                continue;
            }
            if let Ok(val) = self.mem_read_u64(addr) {
                if val == 0 {
                    let _ = self.mem_write_u64(addr, empty);
                }
            }
        }
    }
}

/// Resolves one dynamic relocation to the value written at its target, or
/// None when the entry is left untouched.
pub(crate) fn resolve_dyn_reloc(
    r_type: u32,
    sym_value: u64,
    sym_name: &str,
    addend: i64,
    reloc_offset: u64,
    imports: &HashMap<String, u64>,
) -> Option<u64> {
    match r_type {
        R_AARCH64_RELATIVE => Some(reloc_offset.wrapping_add(addend as u64)),

        R_AARCH64_GLOB_DAT | R_AARCH64_JUMP_SLOT => {
            if sym_value != 0 {
                Some(sym_value.wrapping_add(reloc_offset))
            } else if sym_name == "__stack_chk_guard" {
                // External from libc; the canary value lives in our TLS.
                Some(TLS_BASE + 0x28)
            } else if sym_name == "_ctype_" {
                // Classification table pointer, shifted so index -1 works.
                Some(LIBC_BASE + CTYPE_TABLE_OFFSET + 1)
            } else {
                None
            }
        }

        R_AARCH64_ABS64 => {
            if sym_value != 0 {
                Some(sym_value.wrapping_add(reloc_offset).wrapping_add(addend as u64))
            } else if !sym_name.is_empty() {
                // External symbol; Unity IL2CPP uses ABS64 against malloc and
                // friends, which resolve to their PLT entry.
                imports
                    .get(strip_version(sym_name))
                    .map(|&plt| plt.wrapping_add(addend as u64))
            } else if addend > 0 {
                Some(reloc_offset.wrapping_add(addend as u64))
            } else {
                None
            }
        }

        _ => None,
    }
}

fn collect_symbols(elf: &Elf, reloc_offset: u64, symbols: &mut HashMap<String, u64>) {
    for sym in elf.dynsyms.iter() {
        if sym.st_value == 0 {
            continue;
        }
        if let Some(name) = elf.dynstrtab.get_at(sym.st_name) {
            if name.is_empty() {
                continue;
            }
            let addr = sym.st_value.wrapping_add(reloc_offset);
            symbols.insert(name.to_string(), addr);
            let stripped = strip_version(name);
            if stripped != name {
                symbols.insert(stripped.to_string(), addr);
            }
        }
    }
    for sym in elf.syms.iter() {
        if sym.st_value == 0 {
            continue;
        }
        if let Some(name) = elf.strtab.get_at(sym.st_name) {
            if name.is_empty() {
                continue;
            }
            symbols.insert(name.to_string(), sym.st_value.wrapping_add(reloc_offset));
        }
    }
}

/// Records a PLT entry address for every external import, so that stubs have
/// a hookable target and ABS64 relocations against externals can be
/// satisfied. The n-th `.rela.plt` entry corresponds to the PLT entry at
/// `plt_base + 32 + 16n`.
fn add_plt_symbols(
    elf: &Elf,
    reloc_offset: u64,
    symbols: &mut HashMap<String, u64>,
    imports: &mut HashMap<String, u64>,
) {
    let Some(plt_addr) = elf.section_headers.iter().find_map(|sh| {
        match elf.shdr_strtab.get_at(sh.sh_name) {
            Some(".plt") => Some(sh.sh_addr),
            _ => None,
        }
    }) else {
        return;
    };

    let plt_base = plt_addr.wrapping_add(reloc_offset);

    for (idx, reloc) in elf.pltrelocs.iter().enumerate() {
        let Some(sym) = elf.dynsyms.get(reloc.r_sym) else {
            continue;
        };
        let Some(name) = elf.dynstrtab.get_at(sym.st_name) else {
            continue;
        };
        if name.is_empty() || sym.st_value != 0 {
            continue;
        }

        let plt = plt_base + PLT_HEADER_SIZE + idx as u64 * PLT_ENTRY_SIZE;
        symbols.insert(name.to_string(), plt);
        imports.insert(name.to_string(), plt);
        let stripped = strip_version(name);
        if stripped != name {
            symbols.insert(stripped.to_string(), plt);
            imports.insert(stripped.to_string(), plt);
        }
    }
}

impl ElfInfo {
    /// Looks up a symbol, 0 when absent.
    pub fn find_symbol(&self, name: &str) -> u64 {
        self.symbols.get(name).copied().unwrap_or(0)
    }

    pub fn find_jni_onload(&self) -> u64 {
        if let Some(&addr) = self.symbols.get("JNI_OnLoad") {
            return addr;
        }
        for (name, &addr) in &self.symbols {
            if name.eq_ignore_ascii_case("JNI_OnLoad") {
                return addr;
            }
        }
        0
    }

    pub fn find_symbols_by_substring(&self, substr: &str) -> HashMap<String, u64> {
        let needle = substr.to_lowercase();
        self.symbols
            .iter()
            .filter(|(name, _)| name.to_lowercase().contains(&needle))
            .map(|(name, &addr)| (name.clone(), addr))
            .collect()
    }

    /// Picks an entry point likely to assign key material early.
    ///
    /// An explicit preference is matched exactly, then case-insensitively,
    /// then by substring. Otherwise candidates are ranked:
    ///
    ///   0 regist_lua
    ///   1 AppDelegate::applicationDidFinishLaunching
    ///   2 CCGameMain::applicationDidFinishLaunching
    ///   3 any applicationDidFinishLaunching
    ///   4 cocos_android_app_init
    ///   5 cocos_main
    ///   6 Game::init (Cocos Creator 3.x)
    ///   7 JNI_OnLoad
    ///
    /// Vtable, typeinfo and teardown machinery never qualifies. Fallback is
    /// JNI_OnLoad, then the ELF entry.
    pub fn find_entry_point(&self, preferred: &str) -> u64 {
        if !preferred.is_empty() {
            if let Some(&addr) = self.symbols.get(preferred) {
                return addr;
            }
            for (name, &addr) in &self.symbols {
                if name.eq_ignore_ascii_case(preferred) {
                    return addr;
                }
            }
            let needle = preferred.to_lowercase();
            for (name, &addr) in &self.symbols {
                if name.to_lowercase().contains(&needle) {
                    return addr;
                }
            }
        }

        let mut candidates: Vec<(i32, &str, u64)> = Vec::new();
        for (name, &addr) in &self.symbols {
            if addr == 0 {
                continue;
            }
            if let Some(priority) = entry_priority(name) {
                candidates.push((priority, name.as_str(), addr));
            }
        }

        if !candidates.is_empty() {
            // Name order breaks priority ties deterministically.
            candidates.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
            return candidates[0].2;
        }

        let jni = self.find_jni_onload();
        if jni != 0 {
            return jni;
        }

        self.entry
    }
}

fn entry_priority(name: &str) -> Option<i32> {
    let lower = name.to_lowercase();

    const EXCLUDED: [&str; 8] = [
        "_ztv", "_zti", "_zts", "__func", "__clone", "__target", "destroy", "deallocate",
    ];
    if EXCLUDED.iter().any(|p| lower.contains(p)) {
        return None;
    }

    if lower.contains("regist_lua") {
        Some(0)
    } else if lower.contains("appdelegate") && lower.contains("didfinish") {
        Some(1)
    } else if lower.contains("ccgamemain") && lower.contains("didfinish") {
        Some(2)
    } else if lower.contains("didfinishlaunching") {
        Some(3)
    } else if lower.contains("cocos_android_app_init") {
        Some(4)
    } else if lower.contains("cocos_main") {
        Some(5)
    } else if lower.starts_with("_zn4game") && lower.contains("initev") {
        Some(6)
    } else if name.eq_ignore_ascii_case("JNI_OnLoad") {
        Some(7)
    } else {
        None
    }
}
