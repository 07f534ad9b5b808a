//! Run orchestration: load the binary, install every hook family, pick an
//! entry point, prime the ABI registers, and run until a stop or a guest
//! fault. Faults after a successful load are an expected way for a run to
//! end; whatever was captured up to that point is the result.

use anyhow::{Context, Result};
use capstone::arch::BuildsCapstone;
use capstone::prelude::*;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::emu::vtable::{SlotInfo, is_setter_symbol};
use crate::emu::{Emulator, SENTINEL, VTABLE_STUB_COUNT};
use crate::stubs::{self, setters};
use crate::trace::{Event, default_enricher};

/// Setter-name fragments used when scanning vtable slots for key sinks.
pub const SETTER_PATTERNS: [&str; 5] = [
    "xxteakey",
    "cryptokey",
    "encryptionkey",
    "decryptionkey",
    "secretkey",
];

/// Default hard ceiling on retired instructions.
pub const DEFAULT_MAX_INSN: u64 = 1_000_000;

#[derive(Clone)]
pub struct RunConfig {
    /// Preferred entry symbol; empty selects by priority.
    pub preferred_entry: String,
    /// Explicit load base, 0 for automatic.
    pub load_base: u64,
    /// Stop the run after this many instructions.
    pub max_insn: u64,
    /// Collect per-instruction records (first `trace_limit` instructions).
    pub trace: bool,
    pub trace_limit: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            preferred_entry: String::new(),
            load_base: 0,
            max_insn: DEFAULT_MAX_INSN,
            trace: false,
            trace_limit: 500,
        }
    }
}

/// One rendered instruction, when tracing is on.
pub struct InsnRecord {
    pub addr: u64,
    pub code: [u8; 4],
    pub disasm: String,
    /// Symbol starting at this address, if any.
    pub func_name: Option<String>,
    /// Stub events attributed to this instruction.
    pub events: Vec<Event>,
}

pub struct RunOutcome {
    pub keys: Vec<setters::CapturedKey>,
    pub entry: u64,
    pub entry_name: String,
    pub base_addr: u64,
    pub end_addr: u64,
    pub import_count: usize,
    pub symbol_count: usize,
    pub hooks_installed: usize,
    pub insn_count: u64,
    pub xor_count: u64,
    pub ret_count: u64,
    pub br_count: u64,
    pub stub_calls: u64,
    pub vtable_hits: u64,
    pub trace: Vec<InsnRecord>,
    /// Emulator fault that ended the run, if any. Not an error.
    pub fault: Option<String>,
}

/// Loads and runs one shared object, returning whatever was captured.
pub fn run(path: &Path, config: &RunConfig) -> Result<RunOutcome> {
    stubs::register_all();

    let mut emu = Emulator::new().context("create emulator")?;
    let info = emu
        .load_elf_at(path, config.load_base)
        .context("load ELF")?;

    setters::clear_captured_keys();
    crate::stubs::network::clear_captured_hosts();
    crate::stubs::cxxabi::string::clear_tracked_strings();

    let hooks_installed = stubs::install(&mut emu, &info.imports, &[&info.symbols]);

    let vtable_hits = Rc::new(Cell::new(0u64));
    install_vtable_capture_hooks(&mut emu, &info, vtable_hits.clone());

    // Shortest symbol name per address reads best in traces.
    let mut addr_to_sym: HashMap<u64, &str> = HashMap::new();
    for (name, &addr) in &info.symbols {
        match addr_to_sym.get(&addr) {
            Some(existing) if existing.len() <= name.len() => {}
            _ => {
                addr_to_sym.insert(addr, name);
            }
        }
    }

    let entry = info.find_entry_point(&config.preferred_entry);
    let entry_name = addr_to_sym.get(&entry).unwrap_or(&"unknown").to_string();

    // Prime the argument registers for the chosen entry flavor.
    let mock = emu.get_mock_object();
    if entry_name.contains("cocos_android_app_init") {
        let vm = crate::stubs::jni::java_vm();
        emu.set_x(0, vm)?;
        emu.set_x(1, mock)?;
    } else {
        // Member methods get the mock this; lua_State entries tolerate the
        // same mock for both.
        emu.set_x(0, mock)?;
        emu.set_x(1, mock)?;
    }

    emu.set_lr(SENTINEL)?;
    emu.hook_address(SENTINEL, Rc::new(|_e: &mut Emulator| true));

    // Stub call events flow through the registry callback into a collector
    // that the instruction hook drains.
    let collector: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
    let stub_calls = Arc::new(AtomicU64::new(0));
    {
        let collector = collector.clone();
        let stub_calls = stub_calls.clone();
        stubs::set_on_call(Some(Box::new(move |pc, category, name, detail| {
            stub_calls.fetch_add(1, Ordering::Relaxed);
            let mut event = Event::new(pc, category, name, detail);
            default_enricher(&mut event);
            collector.lock().unwrap().push(event);
        })));
    }

    let insn_count = Rc::new(Cell::new(0u64));
    let xor_count = Rc::new(Cell::new(0u64));
    let ret_count = Rc::new(Cell::new(0u64));
    let br_count = Rc::new(Cell::new(0u64));
    let records: Rc<RefCell<Vec<InsnRecord>>> = Rc::new(RefCell::new(Vec::new()));

    {
        let cs = Capstone::new()
            .arm64()
            .mode(capstone::arch::arm64::ArchMode::Arm)
            .build()
            .map_err(|e| anyhow::anyhow!("capstone: {e}"))?;
        let insn_count = insn_count.clone();
        let xor_count = xor_count.clone();
        let ret_count = ret_count.clone();
        let br_count = br_count.clone();
        let records = records.clone();
        let collector = collector.clone();
        let max_insn = config.max_insn;
        let trace = config.trace;
        let trace_limit = config.trace_limit;
        let addr_to_sym: HashMap<u64, String> = addr_to_sym
            .iter()
            .map(|(&a, &n)| (a, n.to_string()))
            .collect();

        emu.hook_code(Rc::new(move |e: &mut Emulator, addr, _size| {
            let count = insn_count.get() + 1;
            insn_count.set(count);

            if count > max_insn {
                e.stop();
                return;
            }
            // Disassembly is only needed for the rendered window.
            if count > trace_limit {
                return;
            }

            let code = e.mem_read(addr, 4).unwrap_or_default();
            let mut code4 = [0u8; 4];
            if code.len() == 4 {
                code4.copy_from_slice(&code);
            }

            let disasm = match cs.disasm_count(&code4, addr, 1) {
                Ok(insns) => insns.iter().next().map(|i| {
                    format!(
                        "{} {}",
                        i.mnemonic().unwrap_or("???"),
                        i.op_str().unwrap_or("")
                    )
                    .trim()
                    .to_string()
                }),
                Err(_) => None,
            }
            .unwrap_or_else(|| format!(".word 0x{:08x}", u32::from_le_bytes(code4)));

            for tag in instruction_tags(&disasm) {
                match tag {
                    "#xor" => xor_count.set(xor_count.get() + 1),
                    "#ret" => ret_count.set(ret_count.get() + 1),
                    "#br" => br_count.set(br_count.get() + 1),
                    _ => {}
                }
            }

            let events = std::mem::take(&mut *collector.lock().unwrap());
            if trace {
                records.borrow_mut().push(InsnRecord {
                    addr,
                    code: code4,
                    disasm,
                    func_name: addr_to_sym.get(&addr).cloned(),
                    events,
                });
            }
        }));
    }

    let fault = emu.run_from(entry).err().map(|e| e.to_string());

    stubs::set_on_call(None);

    let trace = std::mem::take(&mut *records.borrow_mut());

    Ok(RunOutcome {
        keys: setters::captured_keys(),
        entry,
        entry_name,
        base_addr: info.base_addr,
        end_addr: info.end_addr,
        import_count: info.imports.len(),
        symbol_count: info.symbols.len(),
        hooks_installed,
        insn_count: insn_count.get(),
        xor_count: xor_count.get(),
        ret_count: ret_count.get(),
        br_count: br_count.get(),
        stub_calls: stub_calls.load(Ordering::Relaxed),
        vtable_hits: vtable_hits.get(),
        trace,
        fault,
    })
}

/// Layers key capture over the 256 vtable stubs. When a guest virtual call
/// lands in a stub whose slot index is a known setter slot, the standard
/// member-setter register layout (X1=key, X2=len, X3=sign, X4=len) is
/// decoded and captured with a `vtable[i]->symbol` source.
fn install_vtable_capture_hooks(
    emu: &mut Emulator,
    info: &crate::emu::elf::ElfInfo,
    hits: Rc<Cell<u64>>,
) {
    let mut setter_slots: HashMap<u64, SlotInfo> = HashMap::new();
    for table in info.vtables.tables.values() {
        for slot in table.slots.values() {
            if slot.slot_index >= 0 && is_setter_symbol(&slot.sym_name, &SETTER_PATTERNS) {
                setter_slots.insert(slot.slot_index as u64, slot.clone());
            }
        }
    }

    let vtable_base = emu.get_vtable_stubs();
    let mock = emu.get_mock_object();

    for i in 0..VTABLE_STUB_COUNT {
        let stub_addr = vtable_base + i * 4;
        let slot = setter_slots.get(&i).cloned();
        let hits = hits.clone();

        emu.hook_address(
            stub_addr,
            Rc::new(move |e: &mut Emulator| {
                hits.set(hits.get() + 1);

                if let Some(slot) = &slot {
                    let x1 = e.x(1);
                    let x2 = e.x(2);
                    let x3 = e.x(3);
                    let x4 = e.x(4);

                    if x2 > 0 && x2 < 256 && x1 > 0x1000 {
                        if let Ok(bytes) = e.mem_read(x1, x2 as usize) {
                            let key = String::from_utf8_lossy(&bytes).into_owned();
                            setters::capture_key_direct(
                                e,
                                &key,
                                &format!("vtable[{i}]->{}", slot.sym_name),
                                e.pc(),
                            );
                        }
                    }
                    if x4 > 0 && x4 < 256 && x3 > 0x1000 {
                        if let Ok(bytes) = e.mem_read(x3, x4 as usize) {
                            let sign = String::from_utf8_lossy(&bytes).into_owned();
                            setters::capture_key_direct(
                                e,
                                &sign,
                                &format!("vtable[{i}]->{}[signature]", slot.sym_name),
                                e.pc(),
                            );
                        }
                    }
                }

                let _ = e.set_x(0, mock);
                false
            }),
        );
    }
}

/// Hashtags for one disassembled instruction.
pub fn instruction_tags(disasm: &str) -> Vec<&'static str> {
    let upper = disasm.to_uppercase();
    let mnemonic = upper.split_whitespace().next().unwrap_or("");

    let mut tags: Vec<&'static str> = Vec::new();
    match mnemonic {
        "EOR" => tags.push("#xor"),
        "EOR3" => {
            tags.push("#xor");
            tags.push("#neon");
        }
        "BL" => tags.push("#call"),
        "BLR" => {
            tags.push("#call");
            tags.push("#br");
        }
        "BR" => tags.push("#br"),
        "RET" => tags.push("#ret"),
        "SVC" => tags.push("#syscall"),
        "AESE" | "AESD" | "AESMC" | "AESIMC" => {
            tags.push("#aes");
            tags.push("#crypto");
        }
        "SHA1C" | "SHA1P" | "SHA1M" | "SHA1H" | "SHA1SU0" | "SHA1SU1" => {
            tags.push("#sha1");
            tags.push("#crypto");
        }
        "SHA256H" | "SHA256H2" | "SHA256SU0" | "SHA256SU1" => {
            tags.push("#sha256");
            tags.push("#crypto");
        }
        _ => {}
    }

    if (upper.contains(".16B") || upper.contains(".8B") || upper.contains(".4S")
        || upper.contains(".2D"))
        && !tags.contains(&"#neon")
    {
        tags.push("#neon");
    }

    tags
}

/// True when a block-ending instruction was just rendered; the trace printer
/// inserts a blank line after these.
pub fn is_block_end(disasm: &str) -> bool {
    let upper = disasm.to_uppercase();
    let mnemonic = upper.split_whitespace().next().unwrap_or("");
    matches!(mnemonic, "RET" | "BR" | "B" | "ERET")
        || mnemonic.starts_with("B.")
        || mnemonic.starts_with("CBZ")
        || mnemonic.starts_with("CBNZ")
        || mnemonic.starts_with("TBZ")
        || mnemonic.starts_with("TBNZ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruction_tagging() {
        assert_eq!(instruction_tags("eor x0, x1, x2"), vec!["#xor"]);
        assert_eq!(instruction_tags("ret"), vec!["#ret"]);
        assert_eq!(instruction_tags("blr x8"), vec!["#call", "#br"]);
        assert_eq!(
            instruction_tags("aese v0.16b, v1.16b"),
            vec!["#aes", "#crypto", "#neon"]
        );
        assert!(instruction_tags("add x0, x1, x2").is_empty());
    }

    #[test]
    fn block_end_detection() {
        assert!(is_block_end("ret"));
        assert!(is_block_end("b.eq 0x4000"));
        assert!(is_block_end("cbz x0, 0x4000"));
        assert!(!is_block_end("add x0, x1, x2"));
    }
}
