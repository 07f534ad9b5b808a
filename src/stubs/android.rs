//! Android platform stubs: the liblog print family and the dynamic loader.
//! No further objects are actually loaded; dlopen hands out opaque handles
//! and dlsym manufactures addresses outside the mapped space, so a call
//! through one ends the run instead of corrupting it.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::emu::Emulator;
use crate::stubs::{self, DEFAULT_REGISTRY, format_hex, return_from_stub};

struct DlState {
    handles: HashMap<u64, String>,
    next_handle: u64,
    last_error: String,
}

static DL: Lazy<Mutex<DlState>> = Lazy::new(|| {
    Mutex::new(DlState {
        handles: HashMap::new(),
        next_handle: 0x7F00_0000,
        last_error: String::new(),
    })
});

pub(crate) fn register() {
    let r = &*DEFAULT_REGISTRY;

    r.register(crate::stubs::StubDef {
        name: "__android_log_print",
        aliases: &["__android_log_buf_print", "__android_log_vprint"],
        hook: stub_log_print,
        category: "android",
    });
    r.register(crate::stubs::StubDef {
        name: "__android_log_write",
        aliases: &["__android_log_buf_write"],
        hook: stub_log_write,
        category: "android",
    });
    r.register_func("android", "__android_log_assert", stub_log_assert);
    r.register_func("android", "openlog", stub_void);
    r.register_func("android", "closelog", stub_void);
    r.register_func("android", "syslog", stub_void);

    r.register(crate::stubs::StubDef {
        name: "dlopen",
        aliases: &["android_dlopen_ext"],
        hook: stub_dlopen,
        category: "android",
    });
    r.register_func("android", "dlsym", stub_dlsym);
    r.register_func("android", "dlclose", stub_dlclose);
    r.register_func("android", "dlerror", stub_dlerror);
    r.register_func("android", "dladdr", stub_ret0);
    r.register_func("android", "dl_iterate_phdr", stub_ret0);
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

fn stub_log_print(emu: &mut Emulator) -> bool {
    // (int prio, const char *tag, const char *fmt, ...)
    let tag = emu.mem_read_string(emu.x(1), 64).unwrap_or_default();
    let fmt = emu.mem_read_string(emu.x(2), 256).unwrap_or_default();
    stubs::log_call(emu, "android", "__android_log_print", &format!("[{tag}] {fmt}"));
    let _ = emu.set_x(0, 1);
    return_from_stub(emu);
    false
}

fn stub_log_write(emu: &mut Emulator) -> bool {
    let tag = emu.mem_read_string(emu.x(1), 64).unwrap_or_default();
    let msg = emu.mem_read_string(emu.x(2), 256).unwrap_or_default();
    stubs::log_call(emu, "android", "__android_log_write", &format!("[{tag}] {msg}"));
    let _ = emu.set_x(0, 1);
    return_from_stub(emu);
    false
}

fn stub_log_assert(emu: &mut Emulator) -> bool {
    let cond = emu.mem_read_string(emu.x(0), 128).unwrap_or_default();
    stubs::log_call(emu, "android", "__android_log_assert", &cond);
    true
}

fn stub_dlopen(emu: &mut Emulator) -> bool {
    let filename_ptr = emu.x(0);
    let filename = if filename_ptr != 0 {
        emu.mem_read_string(filename_ptr, 256).unwrap_or_default()
    } else {
        String::new()
    };

    let handle = {
        let mut dl = DL.lock().unwrap();
        let handle = dl.next_handle;
        dl.next_handle += 0x1000;
        dl.handles.insert(handle, filename.clone());
        dl.last_error.clear();
        handle
    };

    stubs::log_call(
        emu,
        "android",
        "dlopen",
        &format!("{filename} -> {}", format_hex(handle)),
    );
    let _ = emu.set_x(0, handle);
    return_from_stub(emu);
    false
}

fn stub_dlsym(emu: &mut Emulator) -> bool {
    let handle = emu.x(0);
    let symbol = emu.mem_read_string(emu.x(1), 128).unwrap_or_default();

    let lib = {
        let mut dl = DL.lock().unwrap();
        match dl.handles.get(&handle) {
            Some(lib) => lib.clone(),
            None if handle != 0 => {
                dl.last_error = "invalid handle".to_string();
                drop(dl);
                let _ = emu.set_x(0, 0);
                return_from_stub(emu);
                return false;
            }
            None => String::new(),
        }
    };

    // A synthetic address just past the libc-globals page. Unmapped, so an
    // actual call through it terminates the run.
    let fake = 0xDEAE_0000u64 + symbol.len() as u64 * 8;
    stubs::log_call(
        emu,
        "android",
        "dlsym",
        &format!("{lib}:{symbol} -> {}", format_hex(fake)),
    );
    let _ = emu.set_x(0, fake);
    return_from_stub(emu);
    false
}

fn stub_dlclose(emu: &mut Emulator) -> bool {
    let handle = emu.x(0);
    DL.lock().unwrap().handles.remove(&handle);
    let _ = emu.set_x(0, 0);
    return_from_stub(emu);
    false
}

fn stub_dlerror(emu: &mut Emulator) -> bool {
    let err = {
        let mut dl = DL.lock().unwrap();
        std::mem::take(&mut dl.last_error)
    };
    if err.is_empty() {
        let _ = emu.set_x(0, 0);
    } else {
        let ptr = emu.malloc(err.len() as u64 + 1);
        let _ = emu.mem_write_string(ptr, &err);
        let _ = emu.set_x(0, ptr);
    }
    return_from_stub(emu);
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dlopen_dlsym_round_trip() {
        let mut emu = Emulator::new().unwrap();
        emu.set_lr(crate::emu::SENTINEL).unwrap();

        let name = emu.malloc(32);
        emu.mem_write_string(name, "libfoo.so").unwrap();
        emu.set_x(0, name).unwrap();
        stub_dlopen(&mut emu);
        let handle = emu.x(0);
        assert!(handle >= 0x7F00_0000);

        let sym = emu.malloc(32);
        emu.mem_write_string(sym, "target_fn").unwrap();
        emu.set_x(0, handle).unwrap();
        emu.set_x(1, sym).unwrap();
        stub_dlsym(&mut emu);
        assert_eq!(emu.x(0), 0xDEAE_0000 + 9 * 8);
    }

    #[test]
    fn dlsym_rejects_unknown_handle() {
        let mut emu = Emulator::new().unwrap();
        emu.set_lr(crate::emu::SENTINEL).unwrap();

        let sym = emu.malloc(32);
        emu.mem_write_string(sym, "x").unwrap();
        emu.set_x(0, 0xBAD0_0001).unwrap();
        emu.set_x(1, sym).unwrap();
        stub_dlsym(&mut emu);
        assert_eq!(emu.x(0), 0);

        stub_dlerror(&mut emu);
        let err_ptr = emu.x(0);
        assert_ne!(err_ptr, 0);
        assert_eq!(emu.mem_read_string(err_ptr, 64).unwrap(), "invalid handle");
    }
}
