//! Locale, environment, character classification and wide-character stubs.
//! Everything reports a plain "C" locale with Android-flavored environment
//! defaults.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::emu::Emulator;
use crate::stubs::{self, DEFAULT_REGISTRY, return_from_stub};

struct LocaleState {
    name_buf: u64,
    lconv_buf: u64,
    env: HashMap<String, String>,
}

static STATE: Lazy<Mutex<LocaleState>> = Lazy::new(|| {
    Mutex::new(LocaleState {
        name_buf: 0,
        lconv_buf: 0,
        env: HashMap::new(),
    })
});

pub(crate) fn register() {
    DEFAULT_REGISTRY.register_func("libc", "setlocale", stub_setlocale);
    DEFAULT_REGISTRY.register_func("libc", "newlocale", stub_newlocale);
    DEFAULT_REGISTRY.register_func("libc", "uselocale", stub_uselocale);
    DEFAULT_REGISTRY.register_func("libc", "freelocale", stub_noop);
    DEFAULT_REGISTRY.register_func("libc", "localeconv", stub_localeconv);

    DEFAULT_REGISTRY.register_func("libc", "sysconf", stub_sysconf);
    DEFAULT_REGISTRY.register_func("libc", "getenv", stub_getenv);
    DEFAULT_REGISTRY.register_func("libc", "setenv", stub_setenv);
    DEFAULT_REGISTRY.register_func("libc", "unsetenv", stub_unsetenv);
    DEFAULT_REGISTRY.register_func("libc", "putenv", stub_putenv);

    DEFAULT_REGISTRY.register_func("libc", "isalpha", stub_isalpha);
    DEFAULT_REGISTRY.register_func("libc", "isdigit", stub_isdigit);
    DEFAULT_REGISTRY.register_func("libc", "isalnum", stub_isalnum);
    DEFAULT_REGISTRY.register_func("libc", "isspace", stub_isspace);
    DEFAULT_REGISTRY.register_func("libc", "isupper", stub_isupper);
    DEFAULT_REGISTRY.register_func("libc", "islower", stub_islower);
    DEFAULT_REGISTRY.register_func("libc", "isxdigit", stub_isxdigit);
    DEFAULT_REGISTRY.register_func("libc", "isprint", stub_isprint);
    DEFAULT_REGISTRY.register_func("libc", "iscntrl", stub_iscntrl);
    DEFAULT_REGISTRY.register_func("libc", "ispunct", stub_ispunct);
    DEFAULT_REGISTRY.register_func("libc", "isgraph", stub_isgraph);
    DEFAULT_REGISTRY.register_func("libc", "isblank", stub_isblank);
    DEFAULT_REGISTRY.register_func("libc", "toupper", stub_toupper);
    DEFAULT_REGISTRY.register_func("libc", "tolower", stub_tolower);

    DEFAULT_REGISTRY.register_func("libc", "wcslen", stub_wcslen);
    DEFAULT_REGISTRY.register_func("libc", "wcscpy", stub_wcscpy);
    DEFAULT_REGISTRY.register_func("libc", "wcsncpy", stub_wcsncpy);
    DEFAULT_REGISTRY.register_func("libc", "wcscmp", stub_wcscmp);
    DEFAULT_REGISTRY.register_func("libc", "wcsncmp", stub_wcsncmp);
    DEFAULT_REGISTRY.register_func("libc", "wcschr", stub_wcschr);
    DEFAULT_REGISTRY.register_func("libc", "wcsrchr", stub_wcsrchr);
    DEFAULT_REGISTRY.register_func("libc", "wcscat", stub_wcscat);
    DEFAULT_REGISTRY.register_func("libc", "wcsncat", stub_wcscat);

    DEFAULT_REGISTRY.register_func("libc", "mbstowcs", stub_mbstowcs);
    DEFAULT_REGISTRY.register_func("libc", "wcstombs", stub_wcstombs);
    DEFAULT_REGISTRY.register_func("libc", "mbtowc", stub_mbtowc);
    DEFAULT_REGISTRY.register_func("libc", "wctomb", stub_wctomb);
    DEFAULT_REGISTRY.register_func("libc", "mblen", stub_mblen);
}

fn stub_noop(emu: &mut Emulator) -> bool {
    return_from_stub(emu);
    false
}

fn stub_setlocale(emu: &mut Emulator) -> bool {
    let locale_ptr = emu.x(1);
    let locale = if locale_ptr != 0 {
        emu.mem_read_string(locale_ptr, 64).unwrap_or_default()
    } else {
        String::new()
    };
    stubs::log_call(emu, "libc", "setlocale", &locale);

    let mut state = STATE.lock().unwrap();
    if state.name_buf == 0 {
        state.name_buf = emu.malloc(8);
        let buf = state.name_buf;
        drop(state);
        let _ = emu.mem_write_string(buf, "C");
        let _ = emu.set_x(0, buf);
    } else {
        let _ = emu.set_x(0, state.name_buf);
    }
    return_from_stub(emu);
    false
}

fn stub_newlocale(emu: &mut Emulator) -> bool {
    let handle = emu.malloc(8);
    let _ = emu.mem_write_u64(handle, 1);
    let _ = emu.set_x(0, handle);
    return_from_stub(emu);
    false
}

fn stub_uselocale(emu: &mut Emulator) -> bool {
    let prev = emu.malloc(8);
    let _ = emu.mem_write_u64(prev, 1);
    let _ = emu.set_x(0, prev);
    return_from_stub(emu);
    false
}

fn stub_localeconv(emu: &mut Emulator) -> bool {
    let mut state = STATE.lock().unwrap();
    if state.lconv_buf == 0 {
        let lconv = emu.malloc(128);
        let dec = emu.malloc(4);
        let sep = emu.malloc(4);
        let _ = emu.mem_write_string(dec, ".");
        let _ = emu.mem_write_string(sep, "");
        let _ = emu.mem_write_u64(lconv, dec);
        let _ = emu.mem_write_u64(lconv + 8, sep);
        state.lconv_buf = lconv;
    }
    let _ = emu.set_x(0, state.lconv_buf);
    return_from_stub(emu);
    false
}

fn stub_sysconf(emu: &mut Emulator) -> bool {
    let name = emu.x(0);
    let result: u64 = match name {
        30 => 4096,    // _SC_PAGESIZE
        83 | 84 => 4,  // _SC_NPROCESSORS_CONF / _ONLN
        2 => 100,      // _SC_CLK_TCK
        0 => 131_072,  // _SC_ARG_MAX
        1 => 999,      // _SC_CHILD_MAX
        4 => 1024,     // _SC_OPEN_MAX
        _ => u64::MAX, // -1
    };
    let _ = emu.set_x(0, result);
    return_from_stub(emu);
    false
}

fn stub_getenv(emu: &mut Emulator) -> bool {
    let name = emu.mem_read_string(emu.x(0), 256).unwrap_or_default();
    stubs::log_call(emu, "libc", "getenv", &name);

    let stored = STATE.lock().unwrap().env.get(&name).cloned();
    let value = stored.or_else(|| {
        match name.as_str() {
            "PATH" => Some("/system/bin:/system/xbin".to_string()),
            "HOME" => Some("/data/data/com.app".to_string()),
            "TMPDIR" | "TEMP" | "TMP" => Some("/data/local/tmp".to_string()),
            "LANG" | "LC_ALL" => Some("C".to_string()),
            _ => None,
        }
    });

    match value {
        Some(val) => {
            let buf = emu.malloc(val.len() as u64 + 1);
            let _ = emu.mem_write_string(buf, &val);
            let _ = emu.set_x(0, buf);
        }
        None => {
            let _ = emu.set_x(0, 0);
        }
    }
    return_from_stub(emu);
    false
}

fn stub_setenv(emu: &mut Emulator) -> bool {
    let name = emu.mem_read_string(emu.x(0), 256).unwrap_or_default();
    let value = emu.mem_read_string(emu.x(1), 1024).unwrap_or_default();
    if !name.is_empty() {
        STATE.lock().unwrap().env.insert(name, value);
    }
    let _ = emu.set_x(0, 0);
    return_from_stub(emu);
    false
}

fn stub_unsetenv(emu: &mut Emulator) -> bool {
    let name = emu.mem_read_string(emu.x(0), 256).unwrap_or_default();
    STATE.lock().unwrap().env.remove(&name);
    let _ = emu.set_x(0, 0);
    return_from_stub(emu);
    false
}

fn stub_putenv(emu: &mut Emulator) -> bool {
    let pair = emu.mem_read_string(emu.x(0), 1024).unwrap_or_default();
    if let Some((name, value)) = pair.split_once('=') {
        STATE
            .lock()
            .unwrap()
            .env
            .insert(name.to_string(), value.to_string());
    }
    let _ = emu.set_x(0, 0);
    return_from_stub(emu);
    false
}

// Character classification. EOF (-1) and non-byte values classify as false.

fn classify(emu: &mut Emulator, pred: fn(u8) -> bool) -> bool {
    let c = emu.x(0);
    let result = c <= 0xff && pred(c as u8);
    let _ = emu.set_x(0, result as u64);
    return_from_stub(emu);
    false
}

fn stub_isalpha(emu: &mut Emulator) -> bool {
    classify(emu, |c| c.is_ascii_alphabetic())
}

fn stub_isdigit(emu: &mut Emulator) -> bool {
    classify(emu, |c| c.is_ascii_digit())
}

fn stub_isalnum(emu: &mut Emulator) -> bool {
    classify(emu, |c| c.is_ascii_alphanumeric())
}

fn stub_isspace(emu: &mut Emulator) -> bool {
    classify(emu, |c| matches!(c, b' ' | b'\t' | b'\n' | b'\r' | 0x0b | 0x0c))
}

fn stub_isupper(emu: &mut Emulator) -> bool {
    classify(emu, |c| c.is_ascii_uppercase())
}

fn stub_islower(emu: &mut Emulator) -> bool {
    classify(emu, |c| c.is_ascii_lowercase())
}

fn stub_isxdigit(emu: &mut Emulator) -> bool {
    classify(emu, |c| c.is_ascii_hexdigit())
}

fn stub_isprint(emu: &mut Emulator) -> bool {
    classify(emu, |c| (0x20..=0x7e).contains(&c))
}

fn stub_iscntrl(emu: &mut Emulator) -> bool {
    classify(emu, |c| c < 0x20 || c == 0x7f)
}

fn stub_ispunct(emu: &mut Emulator) -> bool {
    classify(emu, |c| c.is_ascii_punctuation())
}

fn stub_isgraph(emu: &mut Emulator) -> bool {
    classify(emu, |c| (0x21..=0x7e).contains(&c))
}

fn stub_isblank(emu: &mut Emulator) -> bool {
    classify(emu, |c| c == b' ' || c == b'\t')
}

fn stub_toupper(emu: &mut Emulator) -> bool {
    let c = emu.x(0);
    let result = if c <= 0xff {
        (c as u8).to_ascii_uppercase() as u64
    } else {
        c
    };
    let _ = emu.set_x(0, result);
    return_from_stub(emu);
    false
}

fn stub_tolower(emu: &mut Emulator) -> bool {
    let c = emu.x(0);
    let result = if c <= 0xff {
        (c as u8).to_ascii_lowercase() as u64
    } else {
        c
    };
    let _ = emu.set_x(0, result);
    return_from_stub(emu);
    false
}

// Wide characters are 4 bytes on ARM64 Linux.

fn read_wstring(emu: &Emulator, addr: u64) -> Vec<u32> {
    let mut out = Vec::new();
    for i in 0..4096u64 {
        match emu.mem_read_u32(addr + i * 4) {
            Ok(0) | Err(_) => break,
            Ok(wc) => out.push(wc),
        }
    }
    out
}

fn write_wstring(emu: &mut Emulator, addr: u64, ws: &[u32]) {
    for (i, &wc) in ws.iter().enumerate() {
        let _ = emu.mem_write_u32(addr + i as u64 * 4, wc);
    }
    let _ = emu.mem_write_u32(addr + ws.len() as u64 * 4, 0);
}

fn stub_wcslen(emu: &mut Emulator) -> bool {
    let len = read_wstring(emu, emu.x(0)).len() as u64;
    let _ = emu.set_x(0, len);
    return_from_stub(emu);
    false
}

fn stub_wcscpy(emu: &mut Emulator) -> bool {
    let dest = emu.x(0);
    let ws = read_wstring(emu, emu.x(1));
    write_wstring(emu, dest, &ws);
    let _ = emu.set_x(0, dest);
    return_from_stub(emu);
    false
}

fn stub_wcsncpy(emu: &mut Emulator) -> bool {
    let dest = emu.x(0);
    let n = emu.x(2) as usize;
    let mut ws = read_wstring(emu, emu.x(1));
    ws.truncate(n);
    write_wstring(emu, dest, &ws);
    let _ = emu.set_x(0, dest);
    return_from_stub(emu);
    false
}

fn stub_wcscmp(emu: &mut Emulator) -> bool {
    let a = read_wstring(emu, emu.x(0));
    let b = read_wstring(emu, emu.x(1));
    let result: i64 = match a.cmp(&b) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    };
    let _ = emu.set_x(0, result as u64);
    return_from_stub(emu);
    false
}

fn stub_wcsncmp(emu: &mut Emulator) -> bool {
    let n = emu.x(2) as usize;
    let mut a = read_wstring(emu, emu.x(0));
    let mut b = read_wstring(emu, emu.x(1));
    a.truncate(n);
    b.truncate(n);
    let result: i64 = match a.cmp(&b) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    };
    let _ = emu.set_x(0, result as u64);
    return_from_stub(emu);
    false
}

fn stub_wcschr(emu: &mut Emulator) -> bool {
    let base = emu.x(0);
    let wc = emu.x(1) as u32;
    let ws = read_wstring(emu, base);
    let result = match ws.iter().position(|&c| c == wc) {
        Some(idx) => base + idx as u64 * 4,
        None => 0,
    };
    let _ = emu.set_x(0, result);
    return_from_stub(emu);
    false
}

fn stub_wcsrchr(emu: &mut Emulator) -> bool {
    let base = emu.x(0);
    let wc = emu.x(1) as u32;
    let ws = read_wstring(emu, base);
    let result = match ws.iter().rposition(|&c| c == wc) {
        Some(idx) => base + idx as u64 * 4,
        None => 0,
    };
    let _ = emu.set_x(0, result);
    return_from_stub(emu);
    false
}

fn stub_wcscat(emu: &mut Emulator) -> bool {
    let dest = emu.x(0);
    let mut head = read_wstring(emu, dest);
    head.extend(read_wstring(emu, emu.x(1)));
    write_wstring(emu, dest, &head);
    let _ = emu.set_x(0, dest);
    return_from_stub(emu);
    false
}

fn stub_mbstowcs(emu: &mut Emulator) -> bool {
    let dest = emu.x(0);
    let s = emu.mem_read_string(emu.x(1), emu.x(2).min(4096) as usize).unwrap_or_default();
    if dest != 0 {
        let ws: Vec<u32> = s.bytes().map(|b| b as u32).collect();
        write_wstring(emu, dest, &ws);
    }
    let _ = emu.set_x(0, s.len() as u64);
    return_from_stub(emu);
    false
}

fn stub_wcstombs(emu: &mut Emulator) -> bool {
    let dest = emu.x(0);
    let ws = read_wstring(emu, emu.x(1));
    let n = emu.x(2) as usize;
    let s: String = ws
        .iter()
        .take(n)
        .map(|&wc| char::from_u32(wc).unwrap_or('?'))
        .collect();
    if dest != 0 {
        let _ = emu.mem_write_string(dest, &s);
    }
    let _ = emu.set_x(0, s.len() as u64);
    return_from_stub(emu);
    false
}

fn stub_mbtowc(emu: &mut Emulator) -> bool {
    let dest = emu.x(0);
    let src = emu.x(1);
    if src == 0 {
        let _ = emu.set_x(0, 0);
        return_from_stub(emu);
        return false;
    }
    let byte = emu.mem_read_u8(src).unwrap_or(0);
    if dest != 0 {
        let _ = emu.mem_write_u32(dest, byte as u32);
    }
    let _ = emu.set_x(0, if byte == 0 { 0 } else { 1 });
    return_from_stub(emu);
    false
}

fn stub_wctomb(emu: &mut Emulator) -> bool {
    let dest = emu.x(0);
    let wc = emu.x(1) as u32;
    if dest != 0 {
        let _ = emu.mem_write_u8(dest, (wc & 0xff) as u8);
    }
    let _ = emu.set_x(0, 1);
    return_from_stub(emu);
    false
}

fn stub_mblen(emu: &mut Emulator) -> bool {
    let src = emu.x(0);
    let result = if src != 0 && emu.mem_read_u8(src).unwrap_or(0) != 0 {
        1
    } else {
        0
    };
    let _ = emu.set_x(0, result);
    return_from_stub(emu);
    false
}
