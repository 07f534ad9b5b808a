//! C string and memory-block stubs, implemented against emulator memory with
//! bounded reads.

use crate::emu::Emulator;
use crate::stubs::{DEFAULT_REGISTRY, return_from_stub};

const MEMOP_LIMIT: u64 = 0x10_0000; // 1 MiB sanity cap on block operations

pub(crate) fn register() {
    DEFAULT_REGISTRY.register_func("libc", "memcpy", stub_memcpy);
    DEFAULT_REGISTRY.register_func("libc", "memmove", stub_memcpy);
    DEFAULT_REGISTRY.register_func("libc", "memset", stub_memset);
    DEFAULT_REGISTRY.register_func("libc", "memcmp", stub_memcmp);

    DEFAULT_REGISTRY.register_func("libc", "strlen", stub_strlen);
    DEFAULT_REGISTRY.register_func("libc", "strcmp", stub_strcmp);
    DEFAULT_REGISTRY.register_func("libc", "strncmp", stub_strncmp);
    DEFAULT_REGISTRY.register_func("libc", "strcpy", stub_strcpy);
    DEFAULT_REGISTRY.register_func("libc", "strncpy", stub_strncpy);
    DEFAULT_REGISTRY.register_func("libc", "strcat", stub_strcat);
    DEFAULT_REGISTRY.register_func("libc", "strncat", stub_strncat);
    DEFAULT_REGISTRY.register_func("libc", "strchr", stub_strchr);
    DEFAULT_REGISTRY.register_func("libc", "strrchr", stub_strrchr);
    DEFAULT_REGISTRY.register_func("libc", "strstr", stub_strstr);
    DEFAULT_REGISTRY.register_func("libc", "strdup", stub_strdup);
    DEFAULT_REGISTRY.register_func("libc", "strndup", stub_strndup);
    DEFAULT_REGISTRY.register_func("libc", "strerror", stub_strerror);
    DEFAULT_REGISTRY.register_func("libc", "strerror_r", stub_strerror_r);
}

fn stub_memcpy(emu: &mut Emulator) -> bool {
    let dest = emu.x(0);
    let src = emu.x(1);
    let n = emu.x(2);

    if n > 0 && n < MEMOP_LIMIT {
        if let Ok(data) = emu.mem_read(src, n as usize) {
            let _ = emu.mem_write(dest, &data);
        }
    }

    let _ = emu.set_x(0, dest);
    return_from_stub(emu);
    false
}

fn stub_memset(emu: &mut Emulator) -> bool {
    let dest = emu.x(0);
    let c = (emu.x(1) & 0xff) as u8;
    let n = emu.x(2);

    if n > 0 && n < MEMOP_LIMIT {
        let _ = emu.mem_write(dest, &vec![c; n as usize]);
    }

    let _ = emu.set_x(0, dest);
    return_from_stub(emu);
    false
}

fn stub_memcmp(emu: &mut Emulator) -> bool {
    let n = emu.x(2).min(MEMOP_LIMIT);
    let a = emu.mem_read(emu.x(0), n as usize).unwrap_or_default();
    let b = emu.mem_read(emu.x(1), n as usize).unwrap_or_default();

    let result: i64 = match a.cmp(&b) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    };
    let _ = emu.set_x(0, result as u64);
    return_from_stub(emu);
    false
}

fn stub_strlen(emu: &mut Emulator) -> bool {
    let s = emu.mem_read_string(emu.x(0), 4096).unwrap_or_default();
    let _ = emu.set_x(0, s.len() as u64);
    return_from_stub(emu);
    false
}

fn cmp_result(a: &str, b: &str) -> u64 {
    match a.cmp(b) {
        std::cmp::Ordering::Less => (-1i64) as u64,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }
}

fn stub_strcmp(emu: &mut Emulator) -> bool {
    let s1 = emu.mem_read_string(emu.x(0), 4096).unwrap_or_default();
    let s2 = emu.mem_read_string(emu.x(1), 4096).unwrap_or_default();
    let _ = emu.set_x(0, cmp_result(&s1, &s2));
    return_from_stub(emu);
    false
}

fn stub_strncmp(emu: &mut Emulator) -> bool {
    let n = emu.x(2) as usize;
    let mut s1 = emu.mem_read_string(emu.x(0), n.max(1)).unwrap_or_default();
    let mut s2 = emu.mem_read_string(emu.x(1), n.max(1)).unwrap_or_default();
    s1.truncate(n);
    s2.truncate(n);
    let _ = emu.set_x(0, cmp_result(&s1, &s2));
    return_from_stub(emu);
    false
}

fn stub_strcpy(emu: &mut Emulator) -> bool {
    let dest = emu.x(0);
    let s = emu.mem_read_string(emu.x(1), 4096).unwrap_or_default();
    let _ = emu.mem_write_string(dest, &s);
    let _ = emu.set_x(0, dest);
    return_from_stub(emu);
    false
}

fn stub_strncpy(emu: &mut Emulator) -> bool {
    let dest = emu.x(0);
    let n = emu.x(2) as usize;
    let s = emu.mem_read_string(emu.x(1), n.max(1)).unwrap_or_default();

    let mut buf = vec![0u8; n];
    let bytes = s.as_bytes();
    let copy = bytes.len().min(n);
    buf[..copy].copy_from_slice(&bytes[..copy]);
    let _ = emu.mem_write(dest, &buf);

    let _ = emu.set_x(0, dest);
    return_from_stub(emu);
    false
}

fn stub_strcat(emu: &mut Emulator) -> bool {
    let dest = emu.x(0);
    let head = emu.mem_read_string(dest, 4096).unwrap_or_default();
    let tail = emu.mem_read_string(emu.x(1), 4096).unwrap_or_default();
    let _ = emu.mem_write_string(dest, &(head + &tail));
    let _ = emu.set_x(0, dest);
    return_from_stub(emu);
    false
}

fn stub_strncat(emu: &mut Emulator) -> bool {
    let dest = emu.x(0);
    let n = emu.x(2) as usize;
    let head = emu.mem_read_string(dest, 4096).unwrap_or_default();
    let mut tail = emu.mem_read_string(emu.x(1), 4096).unwrap_or_default();
    tail.truncate(n);
    let _ = emu.mem_write_string(dest, &(head + &tail));
    let _ = emu.set_x(0, dest);
    return_from_stub(emu);
    false
}

fn stub_strchr(emu: &mut Emulator) -> bool {
    let base = emu.x(0);
    let c = (emu.x(1) & 0xff) as u8;
    let s = emu.mem_read_string(base, 4096).unwrap_or_default();

    let result = if c == 0 {
        base + s.len() as u64
    } else {
        match s.bytes().position(|b| b == c) {
            Some(idx) => base + idx as u64,
            None => 0,
        }
    };
    let _ = emu.set_x(0, result);
    return_from_stub(emu);
    false
}

fn stub_strrchr(emu: &mut Emulator) -> bool {
    let base = emu.x(0);
    let c = (emu.x(1) & 0xff) as u8;
    let s = emu.mem_read_string(base, 4096).unwrap_or_default();

    let result = if c == 0 {
        base + s.len() as u64
    } else {
        match s.bytes().rposition(|b| b == c) {
            Some(idx) => base + idx as u64,
            None => 0,
        }
    };
    let _ = emu.set_x(0, result);
    return_from_stub(emu);
    false
}

fn stub_strstr(emu: &mut Emulator) -> bool {
    let base = emu.x(0);
    let haystack = emu.mem_read_string(base, 4096).unwrap_or_default();
    let needle = emu.mem_read_string(emu.x(1), 4096).unwrap_or_default();

    let result = if needle.is_empty() {
        base
    } else {
        match haystack.find(&needle) {
            Some(idx) => base + idx as u64,
            None => 0,
        }
    };
    let _ = emu.set_x(0, result);
    return_from_stub(emu);
    false
}

fn stub_strdup(emu: &mut Emulator) -> bool {
    let s = emu.mem_read_string(emu.x(0), 4096).unwrap_or_default();
    let ptr = emu.malloc(s.len() as u64 + 1);
    let _ = emu.mem_write_string(ptr, &s);
    let _ = emu.set_x(0, ptr);
    return_from_stub(emu);
    false
}

fn stub_strndup(emu: &mut Emulator) -> bool {
    let n = emu.x(1) as usize;
    let mut s = emu.mem_read_string(emu.x(0), n.max(1)).unwrap_or_default();
    s.truncate(n);
    let ptr = emu.malloc(s.len() as u64 + 1);
    let _ = emu.mem_write_string(ptr, &s);
    let _ = emu.set_x(0, ptr);
    return_from_stub(emu);
    false
}

fn stub_strerror(emu: &mut Emulator) -> bool {
    let msg = "Success";
    let ptr = emu.malloc(msg.len() as u64 + 1);
    let _ = emu.mem_write_string(ptr, msg);
    let _ = emu.set_x(0, ptr);
    return_from_stub(emu);
    false
}

fn stub_strerror_r(emu: &mut Emulator) -> bool {
    let buf = emu.x(1);
    if buf != 0 {
        let _ = emu.mem_write_string(buf, "Success");
    }
    let _ = emu.set_x(0, 0);
    return_from_stub(emu);
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Emulator plus a scratch buffer reserved ahead of later allocations.
    fn fixture() -> (Box<Emulator>, u64) {
        let mut emu = Emulator::new().unwrap();
        emu.set_lr(crate::emu::SENTINEL).unwrap();
        let scratch = emu.malloc(0x1000);
        (emu, scratch)
    }

    #[test]
    fn strlen_and_strcmp() {
        let (mut emu, buf) = fixture();
        emu.mem_write_string(buf, "hello").unwrap();
        emu.mem_write_string(buf + 0x20, "help").unwrap();

        emu.set_x(0, buf).unwrap();
        stub_strlen(&mut emu);
        assert_eq!(emu.x(0), 5);

        emu.set_x(0, buf).unwrap();
        emu.set_x(1, buf + 0x20).unwrap();
        stub_strcmp(&mut emu);
        assert_eq!(emu.x(0) as i64, -1);
    }

    #[test]
    fn strchr_finds_first_and_last() {
        let (mut emu, buf) = fixture();
        emu.mem_write_string(buf, "abcabc").unwrap();

        emu.set_x(0, buf).unwrap();
        emu.set_x(1, b'b' as u64).unwrap();
        stub_strchr(&mut emu);
        assert_eq!(emu.x(0), buf + 1);

        emu.set_x(0, buf).unwrap();
        emu.set_x(1, b'b' as u64).unwrap();
        stub_strrchr(&mut emu);
        assert_eq!(emu.x(0), buf + 4);

        emu.set_x(0, buf).unwrap();
        emu.set_x(1, b'z' as u64).unwrap();
        stub_strchr(&mut emu);
        assert_eq!(emu.x(0), 0);
    }

    #[test]
    fn strstr_offsets() {
        let (mut emu, buf) = fixture();
        emu.mem_write_string(buf, "the quick fox").unwrap();
        emu.mem_write_string(buf + 0x40, "quick").unwrap();

        emu.set_x(0, buf).unwrap();
        emu.set_x(1, buf + 0x40).unwrap();
        stub_strstr(&mut emu);
        assert_eq!(emu.x(0), buf + 4);
    }

    #[test]
    fn memcpy_copies_within_cap() {
        let (mut emu, buf) = fixture();
        emu.mem_write(buf, b"0123456789").unwrap();

        emu.set_x(0, buf + 0x100).unwrap();
        emu.set_x(1, buf).unwrap();
        emu.set_x(2, 10).unwrap();
        stub_memcpy(&mut emu);

        assert_eq!(emu.mem_read(buf + 0x100, 10).unwrap(), b"0123456789");
        assert_eq!(emu.x(0), buf + 0x100);
    }

    #[test]
    fn strdup_allocates_copy() {
        let (mut emu, buf) = fixture();
        emu.mem_write_string(buf, "dup me").unwrap();
        emu.set_x(0, buf).unwrap();
        stub_strdup(&mut emu);

        let copy = emu.x(0);
        assert_ne!(copy, buf);
        assert_eq!(emu.mem_read_string(copy, 32).unwrap(), "dup me");
    }
}
