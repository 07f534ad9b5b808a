//! Stub registry and detector framework.
//!
//! Named stubs hook imported symbols at their PLT entry. Detectors watch the
//! symbol table for framework fingerprints (Cocos2d-x, JNI, Lua, ...) and
//! bulk-install whole hook families on first match, so heavyweight scaffolding
//! like the JNI vtables stays out of runs that never need it.

pub mod android;
pub mod cxxabi;
pub mod jni;
pub mod libc;
pub mod lua;
pub mod mock;
pub mod network;
pub mod pthread;
pub mod setters;
pub mod tolua;

use log::debug;
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::emu::{Emulator, RET_INSN};

/// Hook body for a named stub. True stops emulation.
pub type HookFn = fn(&mut Emulator) -> bool;

/// Called when a detector pattern matches. Receives the imports and the
/// merged symbol map; returns the number of hooks installed.
pub type DetectorFn =
    fn(&mut Emulator, &HashMap<String, u64>, &HashMap<String, u64>) -> usize;

#[derive(Clone, Copy)]
pub struct StubDef {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub hook: HookFn,
    pub category: &'static str,
}

#[derive(Clone, Copy)]
pub struct Detector {
    pub name: &'static str,
    /// Symbol patterns: `foo*`, `*foo`, `*foo*`, or plain substring.
    pub patterns: &'static [&'static str],
    pub activate: DetectorFn,
    pub description: &'static str,
}

#[derive(Default)]
struct RegistryInner {
    stubs: HashMap<&'static str, StubDef>,
    detectors: Vec<Detector>,
    activated: HashSet<&'static str>,
    /// Identity of the emulator the registry was last installed into.
    bound_emu: usize,
}

/// Registry of stub definitions and detectors. Registration is safe across
/// threads; emulators themselves are single-threaded.
pub struct Registry {
    inner: Mutex<RegistryInner>,
}

pub static DEFAULT_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Verbose install logging.
pub static DEBUG: AtomicBool = AtomicBool::new(false);

/// Install a zero-returning stub for every import no stub matched.
pub static INSTALL_FALLBACKS: AtomicBool = AtomicBool::new(true);

pub type OnCallFn = Box<dyn Fn(u64, &str, &str, &str) + Send>;

static ON_CALL: Lazy<Mutex<Option<OnCallFn>>> = Lazy::new(|| Mutex::new(None));

impl Registry {
    pub fn new() -> Self {
        Registry {
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    /// Adds a stub under its canonical name and every alias.
    pub fn register(&self, def: StubDef) {
        let mut inner = self.inner.lock().unwrap();
        inner.stubs.insert(def.name, def);
        for alias in def.aliases {
            inner.stubs.insert(alias, def);
        }
    }

    pub fn register_func(&self, category: &'static str, name: &'static str, hook: HookFn) {
        self.register(StubDef {
            name,
            aliases: &[],
            hook,
            category,
        });
    }

    pub fn register_detector(&self, detector: Detector) {
        self.inner.lock().unwrap().detectors.push(detector);
    }

    pub fn count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        let mut seen = HashSet::new();
        inner
            .stubs
            .values()
            .filter(|def| seen.insert(def.name))
            .count()
    }

    pub fn list(&self) -> Vec<&'static str> {
        let inner = self.inner.lock().unwrap();
        let mut seen = HashSet::new();
        let mut names: Vec<&'static str> = inner
            .stubs
            .values()
            .filter(|def| seen.insert(def.name))
            .map(|def| def.name)
            .collect();
        names.sort();
        names
    }

    /// Hooks every registered stub whose symbol appears in `imports` or one
    /// of the extra symbol maps, runs matching detectors, and installs
    /// fallback stubs for whatever imports remain. Returns the number of
    /// hooks installed.
    pub fn install(
        &self,
        emu: &mut Emulator,
        imports: &HashMap<String, u64>,
        symbol_maps: &[&HashMap<String, u64>],
    ) -> usize {
        let mut all_symbols: HashMap<String, u64> = imports.clone();
        for syms in symbol_maps {
            for (name, &addr) in *syms {
                all_symbols.entry(name.clone()).or_insert(addr);
            }
        }

        // Pick detectors under the lock, fire them outside it: activation
        // callbacks log and may consult the registry.
        let (to_activate, stubs) = {
            let mut inner = self.inner.lock().unwrap();

            let emu_token = emu as *mut Emulator as usize;
            if inner.bound_emu != emu_token {
                inner.activated.clear();
                inner.bound_emu = emu_token;
            }

            let mut fired = Vec::new();
            let pending: Vec<Detector> = inner
                .detectors
                .iter()
                .filter(|d| !inner.activated.contains(d.name))
                .copied()
                .collect();
            for det in pending {
                let matched = all_symbols
                    .keys()
                    .any(|sym| det.patterns.iter().any(|p| match_pattern(sym, p)));
                if matched {
                    inner.activated.insert(det.name);
                    fired.push(det);
                }
            }

            (fired, inner.stubs.clone())
        };

        let mut installed = 0;
        for det in to_activate {
            if DEBUG.load(Ordering::Relaxed) {
                debug!("detector {} activated: {}", det.name, det.description);
            }
            installed += (det.activate)(emu, imports, &all_symbols);
        }

        let mut seen: HashSet<u64> = HashSet::new();
        let mut stubbed: HashSet<u64> = HashSet::new();

        // Imports first. Each hooked PLT entry also gets a RET body so stray
        // direct jumps into it are harmless.
        for (name, def) in &stubs {
            if let Some(&addr) = imports.get(*name) {
                if addr == 0 || !seen.insert(addr) {
                    continue;
                }
                stubbed.insert(addr);
                let _ = emu.mem_write(addr, &RET_INSN);
                let hook = def.hook;
                emu.hook_address(addr, Rc::new(move |e: &mut Emulator| hook(e)));
                installed += 1;
                if DEBUG.load(Ordering::Relaxed) {
                    debug!("stub {}/{} at 0x{:x} (import)", def.category, name, addr);
                }
            }
        }

        // Then internal symbols, e.g. statically linked libc.
        for syms in symbol_maps {
            for (name, def) in &stubs {
                if let Some(&addr) = syms.get(*name) {
                    if addr == 0 || !seen.insert(addr) {
                        continue;
                    }
                    stubbed.insert(addr);
                    let hook = def.hook;
                    emu.hook_address(addr, Rc::new(move |e: &mut Emulator| hook(e)));
                    installed += 1;
                    if DEBUG.load(Ordering::Relaxed) {
                        debug!("stub {}/{} at 0x{:x} (internal)", def.category, name, addr);
                    }
                }
            }
        }

        if INSTALL_FALLBACKS.load(Ordering::Relaxed) {
            for (name, &addr) in imports {
                if addr == 0 || stubbed.contains(&addr) || !seen.insert(addr) {
                    continue;
                }
                let _ = emu.mem_write(addr, &RET_INSN);
                let sym = name.clone();
                emu.hook_address(
                    addr,
                    Rc::new(move |e: &mut Emulator| {
                        if DEBUG.load(Ordering::Relaxed) {
                            log_call(e, "fallback", &sym, "");
                        }
                        let _ = e.set_x(0, 0);
                        return_from_stub(e);
                        false
                    }),
                );
                installed += 1;
            }
        }

        installed
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Matches a detector pattern against a symbol name. `*` at either end makes
/// a prefix/suffix/contains glob; anything else matches exact or substring.
pub fn match_pattern(name: &str, pattern: &str) -> bool {
    if pattern.contains('*') {
        if let Some(inner) = pattern
            .strip_prefix('*')
            .and_then(|p| p.strip_suffix('*'))
        {
            return name.contains(inner);
        }
        if let Some(suffix) = pattern.strip_prefix('*') {
            return name.ends_with(suffix);
        }
        if let Some(prefix) = pattern.strip_suffix('*') {
            return name.starts_with(prefix);
        }
    }
    name == pattern || name.contains(pattern)
}

static REGISTER_ALL: std::sync::Once = std::sync::Once::new();

/// Registers every stub family with the default registry. Idempotent.
pub fn register_all() {
    REGISTER_ALL.call_once(|| {
        libc::register();
        cxxabi::register();
        pthread::register();
        network::register();
        android::register();
        jni::register();
        lua::register();
        tolua::register();
        setters::register();
        mock::register();
    });
}

/// Convenience wrapper over the default registry.
pub fn install(
    emu: &mut Emulator,
    imports: &HashMap<String, u64>,
    symbol_maps: &[&HashMap<String, u64>],
) -> usize {
    DEFAULT_REGISTRY.install(emu, imports, symbol_maps)
}

/// Sets the callback invoked on every logged stub call. Receives the guest
/// return address and (category, name, detail).
pub fn set_on_call(cb: Option<OnCallFn>) {
    *ON_CALL.lock().unwrap() = cb;
}

/// Reports a stub call to the trace callback and the debug log. The PC
/// reported is the return address of the call that reached the stub.
pub fn log_call(emu: &Emulator, category: &str, name: &str, detail: &str) {
    let pc = emu.lr();
    if let Some(cb) = ON_CALL.lock().unwrap().as_ref() {
        cb(pc, category, name, detail);
    }
    if DEBUG.load(Ordering::Relaxed) {
        debug!("[{category}] {name} {detail} (pc=0x{pc:x})");
    }
}

/// Fakes a `RET`: the next instruction executed is at the caller's LR.
pub fn return_from_stub(emu: &mut Emulator) {
    let lr = emu.lr();
    let _ = emu.set_pc(lr);
}

pub fn format_hex(v: u64) -> String {
    if v == 0 {
        "0".to_string()
    } else {
        format!("0x{v:x}")
    }
}

pub fn format_ptr(name: &str, val: u64) -> String {
    format!("{name}={}", format_hex(val))
}

pub fn format_ptr_pair(name1: &str, val1: u64, name2: &str, val2: u64) -> String {
    if name2.is_empty() {
        format_ptr(name1, val1)
    } else {
        format!("{} {}", format_ptr(name1, val1), format_ptr(name2, val2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_globs() {
        assert!(match_pattern("lua_settop", "lua_*"));
        assert!(!match_pattern("toluaext", "lua_*"));
        assert!(match_pattern("JNI_OnLoad", "*OnLoad"));
        assert!(match_pattern("my_cocos2d_fn", "*cocos2d*"));
        assert!(match_pattern("setXXTeaKey", "setXXTeaKey"));
        assert!(match_pattern("_ZN3jsb14setXXTeaKeyEv", "setXXTeaKey"));
        assert!(!match_pattern("unrelated", "cocos2d"));
    }

    fn hook_nop(_emu: &mut Emulator) -> bool {
        false
    }

    #[test]
    fn aliases_share_one_definition() {
        let reg = Registry::new();
        reg.register(StubDef {
            name: "_Znwm",
            aliases: &["_Znam", "_ZnwmSt11align_val_t"],
            hook: hook_nop,
            category: "libc",
        });
        assert_eq!(reg.count(), 1);

        let inner = reg.inner.lock().unwrap();
        assert!(inner.stubs.contains_key("_Znwm"));
        assert!(inner.stubs.contains_key("_Znam"));
        assert!(inner.stubs.contains_key("_ZnwmSt11align_val_t"));
    }

    #[test]
    fn install_hooks_imports_and_fallbacks() {
        let reg = Registry::new();
        reg.register_func("libc", "malloc", hook_nop);

        let mut emu = Emulator::new().unwrap();
        let mut imports = HashMap::new();
        // Addresses inside the mapped code region stand in for PLT entries.
        imports.insert("malloc".to_string(), crate::emu::CODE_BASE + 0x100);
        imports.insert("no_such_stub".to_string(), crate::emu::CODE_BASE + 0x110);

        let installed = reg.install(&mut emu, &imports, &[]);
        assert_eq!(installed, 2, "stub plus fallback");

        assert!(emu.has_address_hook(crate::emu::CODE_BASE + 0x100));
        assert!(emu.has_address_hook(crate::emu::CODE_BASE + 0x110));

        // Both hooked entries got a RET body.
        assert_eq!(
            emu.mem_read(crate::emu::CODE_BASE + 0x100, 4).unwrap(),
            RET_INSN
        );
        assert_eq!(
            emu.mem_read(crate::emu::CODE_BASE + 0x110, 4).unwrap(),
            RET_INSN
        );
    }

    #[test]
    fn detector_activates_once_per_emulator() {
        static HITS: AtomicBool = AtomicBool::new(false);

        fn activate(
            _emu: &mut Emulator,
            _imports: &HashMap<String, u64>,
            _symbols: &HashMap<String, u64>,
        ) -> usize {
            HITS.store(true, Ordering::Relaxed);
            7
        }

        let reg = Registry::new();
        reg.register_detector(Detector {
            name: "test-detector",
            patterns: &["cocos2d"],
            activate,
            description: "test",
        });

        let mut emu = Emulator::new().unwrap();
        let imports = HashMap::new();
        let mut symbols = HashMap::new();
        symbols.insert(
            "_ZN7cocos2d11setXXTeaKeyEv".to_string(),
            crate::emu::CODE_BASE + 0x200,
        );

        let installed = reg.install(&mut emu, &imports, &[&symbols]);
        assert!(HITS.load(Ordering::Relaxed));
        assert_eq!(installed, 7);

        // Second install into the same emulator does not re-fire.
        let installed = reg.install(&mut emu, &imports, &[&symbols]);
        assert_eq!(installed, 0);
    }

    #[test]
    fn detector_does_not_fire_without_match() {
        fn activate(
            _emu: &mut Emulator,
            _imports: &HashMap<String, u64>,
            _symbols: &HashMap<String, u64>,
        ) -> usize {
            panic!("must not activate");
        }

        let reg = Registry::new();
        reg.register_detector(Detector {
            name: "never",
            patterns: &["il2cpp"],
            activate,
            description: "test",
        });

        let mut emu = Emulator::new().unwrap();
        let mut symbols = HashMap::new();
        symbols.insert("plain_function".to_string(), crate::emu::CODE_BASE);
        reg.install(&mut emu, &HashMap::new(), &[&symbols]);
    }
}
