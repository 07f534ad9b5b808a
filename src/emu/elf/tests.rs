use super::*;
use crate::emu::vtable::VTableMap;
use crate::emu::{CTYPE_TABLE_OFFSET, LIBC_BASE, TLS_BASE};
use std::collections::HashMap;
use std::path::PathBuf;

fn info_with(symbols: &[(&str, u64)]) -> ElfInfo {
    ElfInfo {
        path: PathBuf::from("test.so"),
        entry: 0x1000,
        symbols: symbols
            .iter()
            .map(|(n, a)| (n.to_string(), *a))
            .collect(),
        imports: HashMap::new(),
        segments: Vec::new(),
        base_addr: 0x4000_0000,
        end_addr: 0x4100_0000,
        vtables: VTableMap::default(),
    }
}

#[test]
fn strip_version_suffixes() {
    assert_eq!(strip_version("memcpy@@GLIBC_2.17"), "memcpy");
    assert_eq!(strip_version("memcpy@GLIBC_2.17"), "memcpy");
    assert_eq!(strip_version("memcpy"), "memcpy");
}

#[test]
fn entry_prefers_jni_onload_over_plain_symbols() {
    let info = info_with(&[
        ("JNI_OnLoad", 0x2000),
        ("il2cpp_init", 0x3000),
        ("some_func", 0x4000),
    ]);
    assert_eq!(info.find_entry_point(""), 0x2000);
}

#[test]
fn entry_preferred_name_matching_is_staged() {
    let info = info_with(&[
        ("JNI_OnLoad", 0x2000),
        ("il2cpp_init", 0x3000),
    ]);

    // Exact, then case-insensitive, then substring.
    assert_eq!(info.find_entry_point("il2cpp_init"), 0x3000);
    assert_eq!(info.find_entry_point("JNI_ONLOAD"), 0x2000);
    assert_eq!(info.find_entry_point("il2cpp"), 0x3000);
}

#[test]
fn entry_falls_back_to_elf_entry() {
    let info = info_with(&[("il2cpp_init", 0x3000)]);
    assert_eq!(info.find_entry_point(""), 0x1000);
}

#[test]
fn entry_priority_ranks_appdelegate_over_jni() {
    let info = info_with(&[
        ("_ZN11AppDelegate30applicationDidFinishLaunchingEv", 0x5000),
        ("JNI_OnLoad", 0x2000),
    ]);
    assert_eq!(info.find_entry_point(""), 0x5000);
}

#[test]
fn entry_priority_regist_lua_wins() {
    let info = info_with(&[
        ("regist_lua_all", 0x6000),
        ("_ZN11AppDelegate30applicationDidFinishLaunchingEv", 0x5000),
        ("JNI_OnLoad", 0x2000),
    ]);
    assert_eq!(info.find_entry_point(""), 0x6000);
}

#[test]
fn entry_excludes_vtable_and_teardown_machinery() {
    let info = info_with(&[
        ("_ZTVN11AppDelegateE_didfinishlaunching", 0x5000),
        ("AppDelegate_didFinishLaunching_destroy", 0x5100),
        ("JNI_OnLoad", 0x2000),
    ]);
    assert_eq!(info.find_entry_point(""), 0x2000);
}

#[test]
fn entry_ties_break_by_symbol_name() {
    let info = info_with(&[
        ("b_didfinishlaunching", 0x5200),
        ("a_didfinishlaunching", 0x5100),
    ]);
    assert_eq!(info.find_entry_point(""), 0x5100);
}

#[test]
fn find_symbols_by_substring_is_case_insensitive() {
    let info = info_with(&[
        ("setXXTeaKey", 0x1000),
        ("_ZN8ZipUtils20setPvrEncryptionKeyE", 0x2000),
        ("unrelated", 0x3000),
    ]);
    let found = info.find_symbols_by_substring("xxteakey");
    assert_eq!(found.len(), 1);
    assert!(found.contains_key("setXXTeaKey"));
}

#[test]
fn relative_reloc_is_idempotent() {
    let imports = HashMap::new();
    let first = resolve_dyn_reloc(R_AARCH64_RELATIVE, 0, "", 0x1234, 0x4000_0000, &imports);
    let second = resolve_dyn_reloc(R_AARCH64_RELATIVE, 0, "", 0x1234, 0x4000_0000, &imports);
    assert_eq!(first, Some(0x4000_1234));
    assert_eq!(first, second);
}

#[test]
fn glob_dat_resolves_internal_symbols() {
    let imports = HashMap::new();
    assert_eq!(
        resolve_dyn_reloc(R_AARCH64_GLOB_DAT, 0x5000, "foo", 0, 0x4000_0000, &imports),
        Some(0x4000_5000)
    );
    assert_eq!(
        resolve_dyn_reloc(R_AARCH64_JUMP_SLOT, 0x5000, "foo", 0, 0x4000_0000, &imports),
        Some(0x4000_5000)
    );
}

#[test]
fn jump_slot_externals_get_synthetic_homes() {
    let imports = HashMap::new();
    assert_eq!(
        resolve_dyn_reloc(
            R_AARCH64_JUMP_SLOT,
            0,
            "__stack_chk_guard",
            0,
            0x4000_0000,
            &imports
        ),
        Some(TLS_BASE + 0x28)
    );
    assert_eq!(
        resolve_dyn_reloc(R_AARCH64_GLOB_DAT, 0, "_ctype_", 0, 0x4000_0000, &imports),
        Some(LIBC_BASE + CTYPE_TABLE_OFFSET + 1)
    );
    assert_eq!(
        resolve_dyn_reloc(R_AARCH64_GLOB_DAT, 0, "unknown_ext", 0, 0x4000_0000, &imports),
        None
    );
}

#[test]
fn abs64_prefers_symbol_then_plt_then_addend() {
    let mut imports = HashMap::new();
    imports.insert("malloc".to_string(), 0x4200_0020u64);

    // Internal symbol: base + value + addend.
    assert_eq!(
        resolve_dyn_reloc(R_AARCH64_ABS64, 0x5000, "foo", 0x10, 0x4000_0000, &imports),
        Some(0x4000_5010)
    );
    // External with a PLT home, version suffix stripped.
    assert_eq!(
        resolve_dyn_reloc(
            R_AARCH64_ABS64,
            0,
            "malloc@@LIBC",
            8,
            0x4000_0000,
            &imports
        ),
        Some(0x4200_0028)
    );
    // External without one: untouched.
    assert_eq!(
        resolve_dyn_reloc(R_AARCH64_ABS64, 0, "free", 0, 0x4000_0000, &imports),
        None
    );
    // No symbol at all but a positive addend: base-relative.
    assert_eq!(
        resolve_dyn_reloc(R_AARCH64_ABS64, 0, "", 0x40, 0x4000_0000, &imports),
        Some(0x4000_0040)
    );
    assert_eq!(
        resolve_dyn_reloc(R_AARCH64_ABS64, 0, "", 0, 0x4000_0000, &imports),
        None
    );
}

#[test]
fn unsupported_reloc_types_are_ignored() {
    let imports = HashMap::new();
    assert_eq!(
        resolve_dyn_reloc(0x123, 0x5000, "foo", 0, 0x4000_0000, &imports),
        None
    );
}
