//! Heap allocation stubs backed by the emulator's bump allocator. Frees are
//! no-ops; a run is short-lived and the heap is large.

use crate::emu::Emulator;
use crate::stubs::{self, DEFAULT_REGISTRY, StubDef, format_ptr_pair, return_from_stub};

pub(crate) fn register() {
    DEFAULT_REGISTRY.register_func("libc", "malloc", stub_malloc);
    DEFAULT_REGISTRY.register_func("libc", "calloc", stub_calloc);
    DEFAULT_REGISTRY.register_func("libc", "realloc", stub_realloc);
    DEFAULT_REGISTRY.register_func("libc", "free", stub_free);
    DEFAULT_REGISTRY.register_func("libc", "getpagesize", stub_getpagesize);

    // operator new / delete, with the aligned and sized variants.
    DEFAULT_REGISTRY.register(StubDef {
        name: "_Znwm",
        aliases: &["_Znam", "_ZnwmSt11align_val_t", "_ZnamSt11align_val_t"],
        hook: stub_new,
        category: "libc",
    });
    DEFAULT_REGISTRY.register(StubDef {
        name: "_ZdlPv",
        aliases: &["_ZdaPv", "_ZdlPvm", "_ZdaPvm"],
        hook: stub_delete,
        category: "libc",
    });
}

/// Allocates and zero-fills (up to a page) so constructors see clean memory.
fn alloc_zeroed(emu: &mut Emulator, size: u64) -> u64 {
    let size = if size == 0 { 16 } else { (size + 15) & !15 };
    let ptr = emu.malloc(size);
    let zeros = vec![0u8; size.min(4096) as usize];
    let _ = emu.mem_write(ptr, &zeros);
    ptr
}

fn stub_malloc(emu: &mut Emulator) -> bool {
    let size = emu.x(0);
    let ptr = alloc_zeroed(emu, size);
    stubs::log_call(emu, "libc", "malloc", &format_ptr_pair("size", size, "->", ptr));
    let _ = emu.set_x(0, ptr);
    return_from_stub(emu);
    false
}

fn stub_calloc(emu: &mut Emulator) -> bool {
    let total = emu.x(0).wrapping_mul(emu.x(1));
    let ptr = alloc_zeroed(emu, total);
    stubs::log_call(emu, "libc", "calloc", &format_ptr_pair("total", total, "->", ptr));
    let _ = emu.set_x(0, ptr);
    return_from_stub(emu);
    false
}

fn stub_realloc(emu: &mut Emulator) -> bool {
    // The old block is leaked; bump allocation has no free list.
    let size = emu.x(1);
    let ptr = alloc_zeroed(emu, size);
    stubs::log_call(emu, "libc", "realloc", &format_ptr_pair("size", size, "->", ptr));
    let _ = emu.set_x(0, ptr);
    return_from_stub(emu);
    false
}

fn stub_free(emu: &mut Emulator) -> bool {
    stubs::log_call(emu, "libc", "free", "");
    return_from_stub(emu);
    false
}

fn stub_new(emu: &mut Emulator) -> bool {
    let size = emu.x(0);
    let ptr = alloc_zeroed(emu, size);
    stubs::log_call(emu, "libc", "new", &format_ptr_pair("size", size, "->", ptr));
    let _ = emu.set_x(0, ptr);
    return_from_stub(emu);
    false
}

fn stub_delete(emu: &mut Emulator) -> bool {
    stubs::log_call(emu, "libc", "delete", "");
    return_from_stub(emu);
    false
}

fn stub_getpagesize(emu: &mut Emulator) -> bool {
    let _ = emu.set_x(0, 4096);
    return_from_stub(emu);
    false
}
