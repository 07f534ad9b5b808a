//! std::string codec and stubs.
//!
//! Two layouts appear in the wild on ARM64 Android:
//!
//! libc++ (NDK), 24-byte object with short string optimization. Bit 0 of the
//! first byte picks the form:
//!
//!   short: byte 0 = length << 1, bytes 1..22 inline data
//!   long:  bytes 0..7 = capacity | 1, 8..15 = length, 16..23 = data pointer
//!
//! libstdc++ (older toolchains), copy-on-write: the object is a single
//! pointer to character data preceded by a `_Rep` header. Reads treat any
//! heap-range pointer at offset 0 whose target is printable as that layout;
//! the `_Rep` header is not consulted because our allocator does not
//! reproduce its placement.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::emu::{Emulator, HEAP_BASE, HEAP_SIZE};
use crate::stubs::{self, DEFAULT_REGISTRY, Detector, return_from_stub};

/// Max inline length for the short form.
pub const SSO_MAX_LEN: usize = 22;
/// Size of the std::string object itself.
pub const SSO_OBJ_SIZE: usize = 24;

/// Strings constructed through the stubs, by object address.
static TRACKED: Lazy<Mutex<HashMap<u64, String>>> = Lazy::new(|| Mutex::new(HashMap::new()));

pub(crate) fn register() {
    DEFAULT_REGISTRY.register_detector(Detector {
        name: "cxxabi-string",
        patterns: &["basic_string", "_ZNSt", "__ndk1"],
        activate: activate_string_hooks,
        description: "C++ std::string SSO stubs",
    });
}

fn activate_string_hooks(
    emu: &mut Emulator,
    _imports: &HashMap<String, u64>,
    symbols: &HashMap<String, u64>,
) -> usize {
    let installed = install_string_hooks(emu, symbols);
    if installed > 0 {
        stubs::log_call(emu, "cxxabi", "activate", "std::string hooks installed");
    }
    installed
}

fn contains_all(name: &str, parts: &[&str]) -> bool {
    parts.iter().all(|p| name.contains(p))
}

/// Matches mangled basic_string members and installs the matching stub.
pub fn install_string_hooks(emu: &mut Emulator, symbols: &HashMap<String, u64>) -> usize {
    let mut installed = 0;
    for (name, &addr) in symbols {
        if addr == 0 {
            continue;
        }

        let hook: crate::stubs::HookFn = if contains_all(name, &["basic_string", "char_traits", "C2"])
            && name.contains("PKc")
        {
            stub_string_ctor
        } else if contains_all(name, &["basic_string", "6assignEPKc"]) {
            stub_string_assign
        } else if contains_all(name, &["basic_string", "c_str"])
            || contains_all(name, &["basic_string", "4data"])
        {
            stub_string_c_str
        } else if contains_all(name, &["basic_string", "4size"])
            || contains_all(name, &["basic_string", "6length"])
        {
            stub_string_size
        } else if contains_all(name, &["basic_string", "5empty"]) {
            stub_string_empty
        } else if contains_all(name, &["basic_string", "5clear"]) {
            stub_string_clear
        } else if contains_all(name, &["basic_string", "ixEm"]) {
            stub_string_index
        } else {
            continue;
        };

        emu.hook_address(addr, std::rc::Rc::new(move |e: &mut Emulator| hook(e)));
        installed += 1;
    }
    installed
}

/// Reads a libc++ SSO string object.
pub fn read_sso_string(emu: &Emulator, addr: u64) -> Option<String> {
    if addr < 0x1000 {
        return None;
    }
    let data = emu.mem_read(addr, SSO_OBJ_SIZE).ok()?;

    if data[0] & 1 == 1 {
        // Long form.
        let length = u64::from_le_bytes(data[8..16].try_into().unwrap());
        let data_ptr = u64::from_le_bytes(data[16..24].try_into().unwrap());
        if length > 4096 || data_ptr < 0x1000 {
            return None;
        }
        let bytes = emu.mem_read(data_ptr, length as usize).ok()?;
        return Some(String::from_utf8_lossy(&bytes).into_owned());
    }

    let length = (data[0] >> 1) as usize;
    if length > SSO_MAX_LEN {
        return None;
    }
    Some(String::from_utf8_lossy(&data[1..1 + length]).into_owned())
}

/// Writes a string in libc++ SSO form. Long payloads go through the guest
/// heap.
pub fn write_sso_string(emu: &mut Emulator, addr: u64, s: &str) -> anyhow::Result<()> {
    let bytes = s.as_bytes();
    let len = bytes.len();

    if len <= SSO_MAX_LEN {
        let mut obj = [0u8; SSO_OBJ_SIZE];
        obj[0] = (len << 1) as u8;
        obj[1..1 + len].copy_from_slice(bytes);
        return emu.mem_write(addr, &obj);
    }

    let buf_size = ((len as u64 + 1) + 15) & !15;
    let data_ptr = emu.malloc(buf_size);
    let mut payload = bytes.to_vec();
    payload.push(0);
    emu.mem_write(data_ptr, &payload)?;

    let mut obj = [0u8; SSO_OBJ_SIZE];
    obj[0..8].copy_from_slice(&(buf_size | 1).to_le_bytes());
    obj[8..16].copy_from_slice(&(len as u64).to_le_bytes());
    obj[16..24].copy_from_slice(&data_ptr.to_le_bytes());
    emu.mem_write(addr, &obj)
}

/// Data pointer for c_str()/data().
pub fn sso_data_ptr(emu: &Emulator, addr: u64) -> u64 {
    if addr < 0x1000 {
        return 0;
    }
    let Ok(data) = emu.mem_read(addr, SSO_OBJ_SIZE) else {
        return 0;
    };
    if data[0] & 1 == 1 {
        u64::from_le_bytes(data[16..24].try_into().unwrap())
    } else {
        addr + 1
    }
}

pub fn sso_length(emu: &Emulator, addr: u64) -> u64 {
    if addr < 0x1000 {
        return 0;
    }
    let Ok(data) = emu.mem_read(addr, SSO_OBJ_SIZE) else {
        return 0;
    };
    if data[0] & 1 == 1 {
        u64::from_le_bytes(data[8..16].try_into().unwrap())
    } else {
        (data[0] >> 1) as u64
    }
}

fn is_printable(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| (0x20..=0x7e).contains(&b))
}

/// Reads a std::string of either layout. Used by setter hooks, which cannot
/// know which standard library produced the reference they were handed.
pub fn read_std_string(emu: &Emulator, addr: u64) -> Option<String> {
    if addr == 0 {
        return None;
    }
    let data = emu.mem_read(addr, SSO_OBJ_SIZE).ok()?;
    let first_qword = u64::from_le_bytes(data[0..8].try_into().unwrap());

    // COW heuristic: offset 0 holds a pointer into our heap.
    if (HEAP_BASE..HEAP_BASE + HEAP_SIZE).contains(&first_qword) {
        if let Ok(s) = emu.mem_read_string(first_qword, 256) {
            if is_printable(&s) {
                return Some(s);
            }
        }
    }

    if data[0] & 1 == 0 {
        let length = (data[0] >> 1) as usize;
        if length > 0 && length <= SSO_MAX_LEN {
            let s = String::from_utf8_lossy(&data[1..1 + length]).into_owned();
            if is_printable(&s) {
                return Some(s);
            }
        }
    } else {
        let length = u64::from_le_bytes(data[8..16].try_into().unwrap());
        let data_ptr = u64::from_le_bytes(data[16..24].try_into().unwrap());
        if length > 0 && length <= 256 && data_ptr != 0 {
            if let Ok(bytes) = emu.mem_read(data_ptr, length as usize) {
                let s = String::from_utf8_lossy(&bytes).into_owned();
                if is_printable(&s) {
                    return Some(s);
                }
            }
        }
    }

    None
}

pub fn tracked_strings() -> HashMap<u64, String> {
    TRACKED.lock().unwrap().clone()
}

pub fn clear_tracked_strings() {
    TRACKED.lock().unwrap().clear();
}

fn track(addr: u64, value: &str) {
    TRACKED.lock().unwrap().insert(addr, value.to_string());
}

fn truncate_for_log(s: &str) -> String {
    if s.len() > 30 {
        format!("{}...", &s[..30])
    } else {
        s.to_string()
    }
}

fn stub_string_ctor(emu: &mut Emulator) -> bool {
    let this = emu.x(0);
    let src = emu.x(1);
    let s = emu.mem_read_string(src, 4096).unwrap_or_default();
    let _ = write_sso_string(emu, this, &s);
    track(this, &s);
    stubs::log_call(
        emu,
        "cxxabi",
        "string::ctor",
        &format!("\"{}\"", truncate_for_log(&s)),
    );
    let _ = emu.set_x(0, this);
    return_from_stub(emu);
    false
}

fn stub_string_assign(emu: &mut Emulator) -> bool {
    let this = emu.x(0);
    let src = emu.x(1);
    let s = emu.mem_read_string(src, 4096).unwrap_or_default();
    let _ = write_sso_string(emu, this, &s);
    track(this, &s);
    stubs::log_call(
        emu,
        "cxxabi",
        "string::assign",
        &format!("\"{}\"", truncate_for_log(&s)),
    );
    let _ = emu.set_x(0, this);
    return_from_stub(emu);
    false
}

fn stub_string_c_str(emu: &mut Emulator) -> bool {
    let this = emu.x(0);
    let _ = emu.set_x(0, sso_data_ptr(emu, this));
    return_from_stub(emu);
    false
}

fn stub_string_size(emu: &mut Emulator) -> bool {
    let this = emu.x(0);
    let _ = emu.set_x(0, sso_length(emu, this));
    return_from_stub(emu);
    false
}

fn stub_string_empty(emu: &mut Emulator) -> bool {
    let this = emu.x(0);
    let _ = emu.set_x(0, (sso_length(emu, this) == 0) as u64);
    return_from_stub(emu);
    false
}

fn stub_string_clear(emu: &mut Emulator) -> bool {
    let this = emu.x(0);
    let _ = write_sso_string(emu, this, "");
    return_from_stub(emu);
    false
}

fn stub_string_index(emu: &mut Emulator) -> bool {
    let this = emu.x(0);
    let index = emu.x(1);
    let data = sso_data_ptr(emu, this);
    let _ = emu.set_x(0, data + index);
    return_from_stub(emu);
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (Box<Emulator>, u64) {
        let mut emu = Emulator::new().unwrap();
        let obj = emu.malloc(SSO_OBJ_SIZE as u64);
        (emu, obj)
    }

    #[test]
    fn short_string_round_trip() {
        let (mut emu, obj) = fixture();
        write_sso_string(&mut emu, obj, "hello").unwrap();

        assert_eq!(read_sso_string(&emu, obj).unwrap(), "hello");
        assert_eq!(sso_length(&emu, obj), 5);
        // Short form stores data inline, one byte in.
        assert_eq!(sso_data_ptr(&emu, obj), obj + 1);
        // Bit 0 clear marks the short form.
        assert_eq!(emu.mem_read_u8(obj).unwrap() & 1, 0);
    }

    #[test]
    fn boundary_length_stays_short() {
        let (mut emu, obj) = fixture();
        let s = "a".repeat(SSO_MAX_LEN);
        write_sso_string(&mut emu, obj, &s).unwrap();
        assert_eq!(emu.mem_read_u8(obj).unwrap() & 1, 0);
        assert_eq!(read_sso_string(&emu, obj).unwrap(), s);
    }

    #[test]
    fn long_string_round_trip() {
        let (mut emu, obj) = fixture();
        let s = "this string is too long for inline storage";
        write_sso_string(&mut emu, obj, s).unwrap();

        assert_eq!(emu.mem_read_u8(obj).unwrap() & 1, 1, "long form flag");
        assert_eq!(read_sso_string(&emu, obj).unwrap(), s);
        assert_eq!(sso_length(&emu, obj), s.len() as u64);

        let data = sso_data_ptr(&emu, obj);
        assert!((HEAP_BASE..HEAP_BASE + HEAP_SIZE).contains(&data));
        assert_eq!(
            emu.mem_read_string(data, 128).unwrap(),
            s,
            "heap payload is NUL terminated"
        );
    }

    #[test]
    fn printable_round_trips_up_to_1k() {
        let (mut emu, obj) = fixture();
        for len in [1usize, 21, 22, 23, 64, 1024] {
            let s: String = (0..len).map(|i| (0x20 + (i % 95) as u8) as char).collect();
            write_sso_string(&mut emu, obj, &s).unwrap();
            assert_eq!(read_sso_string(&emu, obj).unwrap(), s, "len {len}");
            assert_eq!(
                emu.mem_read_u8(obj).unwrap() & 1 == 0,
                len <= SSO_MAX_LEN,
                "classification for len {len}"
            );
        }
    }

    #[test]
    fn read_rejects_implausible_long_forms() {
        let (mut emu, obj) = fixture();
        // Long flag with a null data pointer.
        let mut bogus = [0u8; SSO_OBJ_SIZE];
        bogus[0] = 1;
        bogus[8] = 8;
        emu.mem_write(obj, &bogus).unwrap();
        assert!(read_sso_string(&emu, obj).is_none());
        assert!(read_sso_string(&emu, 0).is_none());
    }

    #[test]
    fn read_std_string_accepts_cow_layout() {
        let (mut emu, obj) = fixture();
        let payload = emu.malloc(32);
        emu.mem_write_string(payload, "cow-key").unwrap();
        emu.mem_write_u64(obj, payload).unwrap();

        assert_eq!(read_std_string(&emu, obj).unwrap(), "cow-key");
    }

    #[test]
    fn read_std_string_accepts_sso_layout() {
        let (mut emu, obj) = fixture();
        write_sso_string(&mut emu, obj, "sso-key").unwrap();
        assert_eq!(read_std_string(&emu, obj).unwrap(), "sso-key");
    }

    #[test]
    fn read_std_string_drops_non_printable() {
        let (mut emu, obj) = fixture();
        let mut raw = [0u8; SSO_OBJ_SIZE];
        raw[0] = 3 << 1;
        raw[1] = 0x01;
        raw[2] = 0x02;
        raw[3] = 0x03;
        emu.mem_write(obj, &raw).unwrap();
        assert!(read_std_string(&emu, obj).is_none());
    }

    #[test]
    fn ctor_stub_writes_and_tracks() {
        let (mut emu, obj) = fixture();
        let src = emu.malloc(32);
        emu.mem_write_string(src, "ctor value").unwrap();
        emu.set_lr(crate::emu::SENTINEL).unwrap();

        emu.set_x(0, obj).unwrap();
        emu.set_x(1, src).unwrap();
        stub_string_ctor(&mut emu);

        assert_eq!(emu.x(0), obj);
        assert_eq!(read_sso_string(&emu, obj).unwrap(), "ctor value");
        assert_eq!(tracked_strings().get(&obj).unwrap(), "ctor value");
    }
}
