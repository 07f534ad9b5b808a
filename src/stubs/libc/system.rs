//! Process-lifecycle stubs. Termination calls stop the run outright.

use crate::emu::Emulator;
use crate::stubs::{self, DEFAULT_REGISTRY, StubDef, format_hex, return_from_stub};

pub(crate) fn register() {
    DEFAULT_REGISTRY.register_func("libc", "abort", stub_abort);
    DEFAULT_REGISTRY.register(StubDef {
        name: "exit",
        aliases: &["_exit", "_Exit"],
        hook: stub_exit,
        category: "libc",
    });
    DEFAULT_REGISTRY.register_func("libc", "atexit", stub_atexit);
}

fn stub_abort(emu: &mut Emulator) -> bool {
    stubs::log_call(emu, "libc", "abort", "program aborted");
    true
}

fn stub_exit(emu: &mut Emulator) -> bool {
    let code = emu.x(0);
    stubs::log_call(emu, "libc", "exit", &format_hex(code));
    true
}

fn stub_atexit(emu: &mut Emulator) -> bool {
    // Handlers are never run; report success.
    let _ = emu.set_x(0, 0);
    return_from_stub(emu);
    false
}
