//! printf-family stubs. No real formatting happens; the format string itself
//! is logged (often revealing debug context) and the buffer variants copy it
//! through so callers that build paths out of literals keep working.

use crate::emu::Emulator;
use crate::stubs::{self, DEFAULT_REGISTRY, return_from_stub};

pub(crate) fn register() {
    let r = &*DEFAULT_REGISTRY;
    r.register_func("libc", "printf", stub_printf);
    r.register_func("libc", "vprintf", stub_printf);
    r.register_func("libc", "fprintf", stub_fprintf);
    r.register_func("libc", "vfprintf", stub_fprintf);
    r.register_func("libc", "sprintf", stub_sprintf);
    r.register_func("libc", "vsprintf", stub_sprintf);
    r.register_func("libc", "snprintf", stub_snprintf);
    r.register_func("libc", "vsnprintf", stub_snprintf);
    r.register_func("libc", "asprintf", stub_asprintf);
    r.register_func("libc", "vasprintf", stub_asprintf);
    r.register_func("libc", "__printf_chk", stub_printf_chk);
    r.register_func("libc", "__fprintf_chk", stub_fprintf_chk);
    r.register_func("libc", "__sprintf_chk", stub_sprintf_chk);
    r.register_func("libc", "__snprintf_chk", stub_snprintf_chk);
    r.register_func("libc", "__vsnprintf_chk", stub_snprintf_chk);
}

fn stub_printf(emu: &mut Emulator) -> bool {
    let format = emu.mem_read_string(emu.x(0), 256).unwrap_or_default();
    stubs::log_call(emu, "libc", "printf", &format);
    let _ = emu.set_x(0, format.len() as u64);
    return_from_stub(emu);
    false
}

fn stub_fprintf(emu: &mut Emulator) -> bool {
    let format = emu.mem_read_string(emu.x(1), 256).unwrap_or_default();
    stubs::log_call(emu, "libc", "fprintf", &format);
    let _ = emu.set_x(0, format.len() as u64);
    return_from_stub(emu);
    false
}

fn stub_sprintf(emu: &mut Emulator) -> bool {
    let dest = emu.x(0);
    let format = emu.mem_read_string(emu.x(1), 4096).unwrap_or_default();
    let _ = emu.mem_write_string(dest, &format);
    let _ = emu.set_x(0, format.len() as u64);
    return_from_stub(emu);
    false
}

fn stub_snprintf(emu: &mut Emulator) -> bool {
    let dest = emu.x(0);
    let n = emu.x(1);
    let mut format = emu
        .mem_read_string(emu.x(2), n.min(4096) as usize)
        .unwrap_or_default();
    if n > 0 {
        if format.len() as u64 >= n {
            format.truncate(n as usize - 1);
        }
        let _ = emu.mem_write_string(dest, &format);
    }
    let _ = emu.set_x(0, format.len() as u64);
    return_from_stub(emu);
    false
}

fn stub_asprintf(emu: &mut Emulator) -> bool {
    let strp = emu.x(0);
    let format = emu.mem_read_string(emu.x(1), 4096).unwrap_or_default();
    let buf = emu.malloc(format.len() as u64 + 1);
    let _ = emu.mem_write_string(buf, &format);
    if strp != 0 {
        let _ = emu.mem_write_u64(strp, buf);
    }
    let _ = emu.set_x(0, format.len() as u64);
    return_from_stub(emu);
    false
}

fn stub_printf_chk(emu: &mut Emulator) -> bool {
    let format = emu.mem_read_string(emu.x(1), 256).unwrap_or_default();
    stubs::log_call(emu, "libc", "__printf_chk", &format);
    let _ = emu.set_x(0, format.len() as u64);
    return_from_stub(emu);
    false
}

fn stub_fprintf_chk(emu: &mut Emulator) -> bool {
    let format = emu.mem_read_string(emu.x(2), 256).unwrap_or_default();
    stubs::log_call(emu, "libc", "__fprintf_chk", &format);
    let _ = emu.set_x(0, format.len() as u64);
    return_from_stub(emu);
    false
}

fn stub_sprintf_chk(emu: &mut Emulator) -> bool {
    // int __sprintf_chk(char *s, int flag, size_t slen, const char *format, ...)
    let dest = emu.x(0);
    let format = emu.mem_read_string(emu.x(3), 4096).unwrap_or_default();
    let _ = emu.mem_write_string(dest, &format);
    let _ = emu.set_x(0, format.len() as u64);
    return_from_stub(emu);
    false
}

fn stub_snprintf_chk(emu: &mut Emulator) -> bool {
    // int __snprintf_chk(char *s, size_t maxlen, int flag, size_t slen,
    //                    const char *format, ...)
    let dest = emu.x(0);
    let n = emu.x(1);
    let mut format = emu
        .mem_read_string(emu.x(4), n.min(4096) as usize)
        .unwrap_or_default();
    if n > 0 {
        if format.len() as u64 >= n {
            format.truncate(n as usize - 1);
        }
        let _ = emu.mem_write_string(dest, &format);
    }
    let _ = emu.set_x(0, format.len() as u64);
    return_from_stub(emu);
    false
}
