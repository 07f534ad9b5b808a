//! C++ ABI stubs: static-init guards, exception machinery, atexit hooks and
//! the demangler entry point. Real unwinding is not modeled; a throw ends
//! the run.

pub mod string;

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::emu::Emulator;
use crate::stubs::{self, DEFAULT_REGISTRY, StubDef, format_ptr, return_from_stub};

/// Guard-variable state for __cxa_guard_acquire/_release.
static GUARDS: Lazy<Mutex<HashMap<u64, bool>>> = Lazy::new(|| Mutex::new(HashMap::new()));

pub(crate) fn register() {
    let r = &*DEFAULT_REGISTRY;

    r.register_func("cxxabi", "__cxa_guard_acquire", stub_guard_acquire);
    r.register_func("cxxabi", "__cxa_guard_release", stub_guard_release);
    r.register_func("cxxabi", "__cxa_guard_abort", stub_void);

    r.register_func("cxxabi", "__cxa_throw", stub_throw);
    r.register_func("cxxabi", "__cxa_rethrow", stub_throw);
    r.register_func("cxxabi", "__cxa_allocate_exception", stub_allocate_exception);
    r.register_func("cxxabi", "__cxa_free_exception", stub_void);
    r.register_func("cxxabi", "__cxa_begin_catch", stub_begin_catch);
    r.register_func("cxxabi", "__cxa_end_catch", stub_void);
    r.register_func("cxxabi", "__cxa_get_exception_ptr", stub_identity);
    r.register_func("cxxabi", "__cxa_current_exception_type", stub_ret0);
    r.register_func("cxxabi", "__cxa_call_unexpected", stub_throw);
    r.register_func("cxxabi", "__cxa_bad_cast", stub_throw);
    r.register_func("cxxabi", "__cxa_bad_typeid", stub_throw);
    r.register_func("cxxabi", "__cxa_pure_virtual", stub_pure_virtual);
    r.register_func("cxxabi", "__cxa_deleted_virtual", stub_pure_virtual);
    r.register_func("cxxabi", "__gxx_personality_v0", stub_ret0);

    r.register(StubDef {
        name: "__cxa_atexit",
        aliases: &["__cxa_thread_atexit", "__cxa_thread_atexit_impl"],
        hook: stub_atexit,
        category: "cxxabi",
    });
    r.register_func("cxxabi", "__cxa_finalize", stub_void);

    r.register_func("cxxabi", "__dynamic_cast", stub_ret0);
    r.register_func("cxxabi", "__cxa_demangle", stub_demangle);

    r.register_func("cxxabi", "_Unwind_Resume", stub_throw);
    r.register_func("cxxabi", "_Unwind_RaiseException", stub_throw);
    r.register_func("cxxabi", "_Unwind_DeleteException", stub_void);
    r.register_func("cxxabi", "_Unwind_GetIP", stub_ret0);
    r.register_func("cxxabi", "_Unwind_SetIP", stub_void);
    r.register_func("cxxabi", "_Unwind_SetGR", stub_void);
    r.register_func("cxxabi", "_Unwind_GetRegionStart", stub_ret0);
    r.register_func("cxxabi", "_Unwind_GetLanguageSpecificData", stub_ret0);

    string::register();
}

fn stub_void(emu: &mut Emulator) -> bool {
    return_from_stub(emu);
    false
}

fn stub_ret0(emu: &mut Emulator) -> bool {
    let _ = emu.set_x(0, 0);
    return_from_stub(emu);
    false
}

fn stub_identity(emu: &mut Emulator) -> bool {
    let x0 = emu.x(0);
    let _ = emu.set_x(0, x0);
    return_from_stub(emu);
    false
}

/// Returns 1 the first time a guard address is seen, 0 afterwards, so static
/// initializers run exactly once.
fn stub_guard_acquire(emu: &mut Emulator) -> bool {
    let guard = emu.x(0);
    let initialized = *GUARDS.lock().unwrap().get(&guard).unwrap_or(&false);
    let result = if initialized { 0 } else { 1 };
    stubs::log_call(
        emu,
        "cxxabi",
        "__cxa_guard_acquire",
        &stubs::format_ptr_pair("guard", guard, "result", result),
    );
    let _ = emu.set_x(0, result);
    return_from_stub(emu);
    false
}

fn stub_guard_release(emu: &mut Emulator) -> bool {
    let guard = emu.x(0);
    GUARDS.lock().unwrap().insert(guard, true);
    return_from_stub(emu);
    false
}

fn stub_throw(emu: &mut Emulator) -> bool {
    let exc = emu.x(0);
    stubs::log_call(emu, "cxxabi", "__cxa_throw", &format_ptr("exception", exc));
    true
}

fn stub_pure_virtual(emu: &mut Emulator) -> bool {
    stubs::log_call(emu, "cxxabi", "__cxa_pure_virtual", "");
    true
}

fn stub_allocate_exception(emu: &mut Emulator) -> bool {
    let size = emu.x(0).max(64);
    let ptr = emu.malloc(size + 128); // room for the exception header
    let _ = emu.set_x(0, ptr);
    return_from_stub(emu);
    false
}

fn stub_begin_catch(emu: &mut Emulator) -> bool {
    let exc = emu.x(0);
    let _ = emu.set_x(0, exc);
    return_from_stub(emu);
    false
}

fn stub_atexit(emu: &mut Emulator) -> bool {
    let _ = emu.set_x(0, 0);
    return_from_stub(emu);
    false
}

/// Identity "demangler": hands back a heap copy of the mangled name.
fn stub_demangle(emu: &mut Emulator) -> bool {
    let mangled = emu.mem_read_string(emu.x(0), 512).unwrap_or_default();
    let status = emu.x(3);
    stubs::log_call(emu, "cxxabi", "__cxa_demangle", &mangled);

    let result = emu.malloc(mangled.len() as u64 + 1);
    let _ = emu.mem_write_string(result, &mangled);
    if status != 0 {
        let _ = emu.mem_write_u32(status, 0);
    }
    let _ = emu.set_x(0, result);
    return_from_stub(emu);
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_acquire_is_once() {
        let mut emu = Emulator::new().unwrap();
        emu.set_lr(crate::emu::SENTINEL).unwrap();

        // Guard addresses are process-wide state; pick one unique to this test.
        let guard = 0xDEAB_F000u64;
        emu.set_x(0, guard).unwrap();
        stub_guard_acquire(&mut emu);
        assert_eq!(emu.x(0), 1, "first acquire initializes");

        emu.set_x(0, guard).unwrap();
        stub_guard_release(&mut emu);

        emu.set_x(0, guard).unwrap();
        stub_guard_acquire(&mut emu);
        assert_eq!(emu.x(0), 0, "second acquire skips");
    }

    #[test]
    fn throw_stops_emulation() {
        let mut emu = Emulator::new().unwrap();
        emu.set_lr(crate::emu::SENTINEL).unwrap();
        emu.set_x(0, 0x1234).unwrap();
        assert!(stub_throw(&mut emu));
    }
}
