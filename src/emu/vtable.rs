//! C++ vtable resolution in the Itanium ABI: vtable ranges come from `_ZTV*`
//! symbols, slot targets from the dynamic relocations that land inside them.

use goblin::elf::Elf;
use goblin::elf::sym::{STT_FUNC, Sym};
use std::collections::HashMap;

use super::elf::{
    R_AARCH64_ABS64, R_AARCH64_GLOB_DAT, R_AARCH64_JUMP_SLOT, R_AARCH64_RELATIVE, strip_version,
};

/// A resolved vtable slot.
#[derive(Clone, Debug)]
pub struct SlotInfo {
    /// Resolved function address.
    pub target: u64,
    /// Symbol name when one could be attributed.
    pub sym_name: String,
    /// Relocation type that populated the slot.
    pub reloc_type: u32,
    /// Logical slot index, -1 for the 16-byte RTTI prefix.
    pub slot_index: i64,
}

pub struct VTable {
    /// Mangled vtable symbol, e.g. `_ZTVN7cocos2d8LuaStackE`.
    pub name: String,
    /// Demangled class name, e.g. `cocos2d::LuaStack`.
    pub class_name: String,
    /// Rebased base address.
    pub start: u64,
    pub size: u64,
    /// Byte offset from `start` to the resolved slot.
    pub slots: HashMap<u64, SlotInfo>,
}

#[derive(Default)]
pub struct VTableMap {
    pub tables: HashMap<u64, VTable>,
    /// Class name to vtable base.
    pub by_class: HashMap<String, u64>,
    /// Slot byte offset to every candidate across classes.
    pub slot_index: HashMap<u64, Vec<SlotInfo>>,
}

struct VtRange {
    name: String,
    class_name: String,
    start: u64,
    end: u64,
}

/// Walks the relocation tables and attributes every entry that falls inside
/// a `_ZTV*` range to its vtable slot.
pub fn build_vtable_map(elf: &Elf, reloc_offset: u64) -> VTableMap {
    let mut vtm = VTableMap::default();

    let mut vt_syms: Vec<(String, u64, u64)> = Vec::new();
    let mut add_vt = |name: Option<&str>, sym: &Sym| {
        if let Some(name) = name {
            if sym.st_value != 0 && name.starts_with("_ZTV") {
                vt_syms.push((name.to_string(), sym.st_value, sym.st_size));
            }
        }
    };
    for sym in elf.dynsyms.iter() {
        add_vt(elf.dynstrtab.get_at(sym.st_name), &sym);
    }
    for sym in elf.syms.iter() {
        add_vt(elf.strtab.get_at(sym.st_name), &sym);
    }

    vt_syms.sort_by_key(|(_, value, _)| *value);
    vt_syms.dedup_by_key(|(_, value, _)| *value);

    let mut ranges: Vec<VtRange> = Vec::new();
    for (i, (name, value, size)) in vt_syms.iter().enumerate() {
        let start = value.wrapping_add(reloc_offset);
        let end = if *size != 0 {
            start + size
        } else if i + 1 < vt_syms.len() {
            vt_syms[i + 1].1.wrapping_add(reloc_offset)
        } else {
            start + 0x400
        };
        ranges.push(VtRange {
            name: name.clone(),
            class_name: extract_class_name(name),
            start,
            end,
        });
    }

    // Reverse map for naming RELATIVE targets, which carry no symbol index.
    // Shortest name wins so aliases do not shadow the canonical symbol.
    let mut addr_to_sym: HashMap<u64, String> = HashMap::new();
    let mut add_rev = |name: Option<&str>, sym: &Sym| {
        let Some(name) = name else { return };
        if sym.st_value == 0 || name.is_empty() || sym.st_type() != STT_FUNC {
            return;
        }
        let addr = sym.st_value.wrapping_add(reloc_offset);
        let clean = strip_version(name);
        match addr_to_sym.get(&addr) {
            Some(existing) if existing.len() <= clean.len() => {}
            _ => {
                addr_to_sym.insert(addr, clean.to_string());
            }
        }
    };
    for sym in elf.dynsyms.iter() {
        add_rev(elf.dynstrtab.get_at(sym.st_name), &sym);
    }
    for sym in elf.syms.iter() {
        add_rev(elf.strtab.get_at(sym.st_name), &sym);
    }

    for reloc in elf.dynrelas.iter().chain(elf.pltrelocs.iter()) {
        let target_addr = reloc.r_offset.wrapping_add(reloc_offset);
        let Some(range) = ranges
            .iter()
            .find(|r| target_addr >= r.start && target_addr < r.end)
        else {
            continue;
        };

        let addend = reloc.r_addend.unwrap_or(0);
        let sym = elf.dynsyms.get(reloc.r_sym);
        let sym_value = sym.as_ref().map(|s| s.st_value).unwrap_or(0);

        let resolved = match reloc.r_type {
            R_AARCH64_RELATIVE => reloc_offset.wrapping_add(addend as u64),
            R_AARCH64_ABS64 => {
                if sym_value != 0 {
                    sym_value
                        .wrapping_add(reloc_offset)
                        .wrapping_add(addend as u64)
                } else {
                    reloc_offset.wrapping_add(addend as u64)
                }
            }
            R_AARCH64_GLOB_DAT | R_AARCH64_JUMP_SLOT => {
                if sym_value != 0 {
                    sym_value.wrapping_add(reloc_offset)
                } else {
                    0
                }
            }
            _ => continue,
        };
        if resolved == 0 {
            continue;
        }

        let slot_offset = target_addr - range.start;
        let slot_index = if slot_offset >= 16 {
            ((slot_offset - 16) / 8) as i64
        } else {
            -1
        };

        let mut sym_name = sym
            .as_ref()
            .and_then(|s| elf.dynstrtab.get_at(s.st_name))
            .filter(|n| !n.is_empty())
            .map(|n| strip_version(n).to_string())
            .unwrap_or_default();
        if sym_name.is_empty() {
            if let Some(name) = addr_to_sym.get(&resolved) {
                sym_name = name.clone();
            }
        }

        let table = vtm.tables.entry(range.start).or_insert_with(|| VTable {
            name: range.name.clone(),
            class_name: range.class_name.clone(),
            start: range.start,
            size: range.end - range.start,
            slots: HashMap::new(),
        });
        if !range.class_name.is_empty() {
            vtm.by_class
                .entry(range.class_name.clone())
                .or_insert(range.start);
        }

        let slot = SlotInfo {
            target: resolved,
            sym_name,
            reloc_type: reloc.r_type,
            slot_index,
        };
        table.slots.insert(slot_offset, slot.clone());
        vtm.slot_index.entry(slot_offset).or_default().push(slot);
    }

    vtm
}

impl VTableMap {
    /// Resolves a virtual call by vtable base and logical slot index.
    pub fn resolve_virtual_call(&self, vtable_base: u64, slot_index: u64) -> Option<&SlotInfo> {
        self.resolve_by_slot_offset(vtable_base, 16 + slot_index * 8)
    }

    /// Resolves by raw byte offset from the vtable base, as read out of LDR
    /// offsets.
    pub fn resolve_by_slot_offset(&self, vtable_base: u64, slot_offset: u64) -> Option<&SlotInfo> {
        self.tables.get(&vtable_base)?.slots.get(&slot_offset)
    }

    /// Collects every slot whose attributed symbol matches one of the
    /// patterns, grouped by vtable base.
    pub fn find_setter_slots(&self, patterns: &[&str]) -> HashMap<u64, HashMap<u64, SlotInfo>> {
        let mut result: HashMap<u64, HashMap<u64, SlotInfo>> = HashMap::new();
        for (&base, table) in &self.tables {
            for (&off, slot) in &table.slots {
                if is_setter_symbol(&slot.sym_name, patterns) {
                    result.entry(base).or_default().insert(off, slot.clone());
                }
            }
        }
        result
    }

    /// Flat target address to symbol name map for every matched setter,
    /// suitable for installing direct hooks.
    pub fn all_setter_targets(&self, patterns: &[&str]) -> HashMap<u64, String> {
        let mut result = HashMap::new();
        for table in self.tables.values() {
            for slot in table.slots.values() {
                if is_setter_symbol(&slot.sym_name, patterns) {
                    result.insert(slot.target, slot.sym_name.clone());
                }
            }
        }
        result
    }
}

pub fn is_setter_symbol(sym_name: &str, patterns: &[&str]) -> bool {
    if sym_name.is_empty() {
        return false;
    }
    let lower = sym_name.to_lowercase();
    patterns.iter().any(|p| lower.contains(&p.to_lowercase()))
}

/// `_ZTVN7cocos2d8LuaStackE` becomes `cocos2d::LuaStack`. Embedded template
/// arguments terminate the walk.
pub fn extract_class_name(mangled: &str) -> String {
    let Some(rest) = mangled.strip_prefix("_ZTV") else {
        return String::new();
    };

    if let Some(nested) = rest.strip_prefix('N') {
        return parse_nested_name(nested);
    }

    if rest.starts_with(|c: char| c.is_ascii_digit() && c != '0') {
        if let Some((_, name)) = parse_length_prefixed(rest) {
            return name.to_string();
        }
    }

    String::new()
}

fn parse_nested_name(s: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    let mut rest = s;

    while let Some(c) = rest.chars().next() {
        if c == 'E' || c == 'I' {
            break;
        }
        match parse_length_prefixed(rest) {
            Some((consumed, name)) => {
                parts.push(name);
                rest = &rest[consumed..];
            }
            None => break,
        }
    }

    parts.join("::")
}

/// Parses `7cocos2d...` into (bytes consumed, "cocos2d").
fn parse_length_prefixed(s: &str) -> Option<(usize, &str)> {
    let digits = s.bytes().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 || s.as_bytes()[0] == b'0' {
        return None;
    }
    let len: usize = s[..digits].parse().ok()?;
    if len == 0 || digits + len > s.len() {
        return None;
    }
    Some((digits + len, &s[digits..digits + len]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emu::elf::R_AARCH64_RELATIVE;

    #[test]
    fn class_name_nested() {
        assert_eq!(
            extract_class_name("_ZTVN7cocos2d8LuaStackE"),
            "cocos2d::LuaStack"
        );
        assert_eq!(
            extract_class_name("_ZTVN7cocos2d15ResourcesDecodeE"),
            "cocos2d::ResourcesDecode"
        );
    }

    #[test]
    fn class_name_simple() {
        assert_eq!(extract_class_name("_ZTV11AppDelegate"), "AppDelegate");
    }

    #[test]
    fn class_name_template_terminates() {
        assert_eq!(
            extract_class_name("_ZTVN7cocos2d6VectorIPNS_5NodeEEE"),
            "cocos2d::Vector"
        );
    }

    #[test]
    fn class_name_rejects_non_vtable() {
        assert_eq!(extract_class_name("_ZTI11AppDelegate"), "");
        assert_eq!(extract_class_name("malloc"), "");
    }

    #[test]
    fn setter_symbol_match_is_case_insensitive() {
        let patterns = ["xxteakey", "cryptokey"];
        assert!(is_setter_symbol(
            "_ZN7cocos2d11setXXTeaKeyEv",
            &patterns
        ));
        assert!(is_setter_symbol("SetCryptoKeyAndSign", &patterns));
        assert!(!is_setter_symbol("setVolume", &patterns));
        assert!(!is_setter_symbol("", &patterns));
    }

    #[test]
    fn slot_queries_round_trip() {
        let mut vtm = VTableMap::default();
        let mut slots = HashMap::new();
        slots.insert(
            0x30u64,
            SlotInfo {
                target: 0x4000_1000,
                sym_name: "setCryptoKeyAndSign".into(),
                reloc_type: R_AARCH64_RELATIVE,
                slot_index: 2,
            },
        );
        vtm.tables.insert(
            0x4100_0000,
            VTable {
                name: "_ZTV9KeyHolder".into(),
                class_name: "KeyHolder".into(),
                start: 0x4100_0000,
                size: 0x40,
                slots,
            },
        );

        let slot = vtm.resolve_virtual_call(0x4100_0000, 2).unwrap();
        assert_eq!(slot.target, 0x4000_1000);
        assert!(vtm.resolve_virtual_call(0x4100_0000, 3).is_none());
        assert!(vtm.resolve_by_slot_offset(0x4100_0000, 0x30).is_some());

        let setters = vtm.find_setter_slots(&["cryptokey"]);
        assert_eq!(setters.len(), 1);
        assert!(setters[&0x4100_0000].contains_key(&0x30));

        let targets = vtm.all_setter_targets(&["cryptokey"]);
        assert_eq!(targets[&0x4000_1000], "setCryptoKeyAndSign");
    }
}
