//! File and directory stubs. There is no real filesystem behind them: opens
//! hand out tracked descriptors, reads hit EOF, writes claim success. That is
//! enough for init paths that probe for asset packs and config files.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::emu::Emulator;
use crate::stubs::{self, DEFAULT_REGISTRY, return_from_stub};

struct FileState {
    next_fd: u64,
    open: HashMap<u64, String>,
    pos: HashMap<u64, u64>,
}

static STATE: Lazy<Mutex<FileState>> = Lazy::new(|| {
    Mutex::new(FileState {
        next_fd: 10, // leave room below for stdio
        open: HashMap::new(),
        pos: HashMap::new(),
    })
});

fn alloc_fd(path: String) -> u64 {
    let mut state = STATE.lock().unwrap();
    let fd = state.next_fd;
    state.next_fd += 1;
    state.open.insert(fd, path);
    state.pos.insert(fd, 0);
    fd
}

pub(crate) fn register() {
    let r = &*DEFAULT_REGISTRY;

    r.register(crate::stubs::StubDef {
        name: "open",
        aliases: &["open64"],
        hook: stub_open,
        category: "libc",
    });
    r.register(crate::stubs::StubDef {
        name: "openat",
        aliases: &["openat64"],
        hook: stub_openat,
        category: "libc",
    });
    r.register(crate::stubs::StubDef {
        name: "creat",
        aliases: &["creat64"],
        hook: stub_open,
        category: "libc",
    });
    r.register_func("libc", "close", stub_close);

    r.register_func("libc", "read", stub_read);
    r.register_func("libc", "write", stub_write);
    r.register(crate::stubs::StubDef {
        name: "pread",
        aliases: &["pread64"],
        hook: stub_read,
        category: "libc",
    });
    r.register(crate::stubs::StubDef {
        name: "pwrite",
        aliases: &["pwrite64"],
        hook: stub_pwrite,
        category: "libc",
    });
    r.register_func("libc", "readv", stub_readv);
    r.register_func("libc", "writev", stub_writev);
    r.register(crate::stubs::StubDef {
        name: "lseek",
        aliases: &["lseek64"],
        hook: stub_lseek,
        category: "libc",
    });

    r.register(crate::stubs::StubDef {
        name: "stat",
        aliases: &["stat64", "lstat", "lstat64"],
        hook: stub_stat,
        category: "libc",
    });
    r.register(crate::stubs::StubDef {
        name: "fstat",
        aliases: &["fstat64"],
        hook: stub_fstat,
        category: "libc",
    });
    r.register(crate::stubs::StubDef {
        name: "fstatat",
        aliases: &["fstatat64"],
        hook: stub_fstatat,
        category: "libc",
    });
    r.register_func("libc", "access", stub_ret0);
    r.register_func("libc", "faccessat", stub_ret0);

    r.register_func("libc", "dup", stub_dup);
    r.register_func("libc", "dup2", stub_dup2);
    r.register_func("libc", "dup3", stub_dup2);
    r.register_func("libc", "pipe", stub_pipe);
    r.register_func("libc", "pipe2", stub_pipe);

    r.register(crate::stubs::StubDef {
        name: "mmap",
        aliases: &["mmap64"],
        hook: stub_mmap,
        category: "libc",
    });
    r.register_func("libc", "munmap", stub_ret0);
    r.register_func("libc", "mprotect", stub_ret0);
    r.register_func("libc", "msync", stub_ret0);
    r.register_func("libc", "madvise", stub_ret0);

    r.register_func("libc", "mkdir", stub_path_ret0);
    r.register_func("libc", "mkdirat", stub_ret0);
    r.register_func("libc", "rmdir", stub_path_ret0);
    r.register_func("libc", "getcwd", stub_getcwd);
    r.register_func("libc", "chdir", stub_ret0);
    r.register_func("libc", "fchdir", stub_ret0);
    r.register_func("libc", "opendir", stub_retnull);
    r.register_func("libc", "fdopendir", stub_retnull);
    r.register_func("libc", "readdir", stub_retnull);
    r.register_func("libc", "readdir_r", stub_readdir_r);
    r.register_func("libc", "closedir", stub_ret0);
    r.register_func("libc", "rewinddir", stub_void);

    r.register_func("libc", "rename", stub_ret0);
    r.register_func("libc", "renameat", stub_ret0);
    r.register_func("libc", "unlink", stub_path_ret0);
    r.register_func("libc", "unlinkat", stub_ret0);
    r.register_func("libc", "remove", stub_path_ret0);
    r.register_func("libc", "link", stub_ret0);
    r.register_func("libc", "linkat", stub_ret0);
    r.register_func("libc", "symlink", stub_ret0);
    r.register_func("libc", "symlinkat", stub_ret0);
    r.register_func("libc", "readlink", stub_retneg1);
    r.register_func("libc", "readlinkat", stub_retneg1);
    r.register_func("libc", "realpath", stub_realpath);

    r.register_func("libc", "chmod", stub_ret0);
    r.register_func("libc", "fchmod", stub_ret0);
    r.register_func("libc", "fchmodat", stub_ret0);
    r.register_func("libc", "chown", stub_ret0);
    r.register_func("libc", "fchown", stub_ret0);
    r.register_func("libc", "lchown", stub_ret0);
    r.register_func("libc", "fchownat", stub_ret0);
    r.register_func("libc", "umask", stub_umask);
    r.register(crate::stubs::StubDef {
        name: "truncate",
        aliases: &["truncate64", "ftruncate", "ftruncate64"],
        hook: stub_ret0,
        category: "libc",
    });
    r.register_func("libc", "flock", stub_ret0);
    r.register_func("libc", "lockf", stub_ret0);
    r.register_func("libc", "fcntl", stub_ret0);
    r.register_func("libc", "fsync", stub_ret0);
    r.register_func("libc", "fdatasync", stub_ret0);
    r.register_func("libc", "sync", stub_void);
    r.register_func("libc", "mkstemp", stub_mkstemp);
    r.register_func("libc", "mkdtemp", stub_mkdtemp);

    // Stream API.
    r.register_func("libc", "fopen", stub_retnull);
    r.register(crate::stubs::StubDef {
        name: "tmpfile",
        aliases: &["tmpfile64"],
        hook: stub_retnull,
        category: "libc",
    });
    r.register_func("libc", "fclose", stub_ret0);
    r.register_func("libc", "fread", stub_ret0);
    r.register_func("libc", "fwrite", stub_fwrite);
    r.register_func("libc", "fseek", stub_ret0);
    r.register_func("libc", "ftell", stub_ret0);
    r.register_func("libc", "rewind", stub_void);
    r.register_func("libc", "feof", stub_ret1);
    r.register_func("libc", "ferror", stub_ret0);
    r.register_func("libc", "clearerr", stub_void);
    r.register_func("libc", "fflush", stub_ret0);
    r.register_func("libc", "fileno", stub_ret1);
    r.register_func("libc", "fputc", stub_retx1);
    r.register_func("libc", "fputs", stub_fputs);
    r.register_func("libc", "putc", stub_retx1);
    r.register_func("libc", "putchar", stub_retx0);
    r.register_func("libc", "puts", stub_puts);
    r.register_func("libc", "perror", stub_perror);
}

fn stub_ret0(emu: &mut Emulator) -> bool {
    let _ = emu.set_x(0, 0);
    return_from_stub(emu);
    false
}

fn stub_ret1(emu: &mut Emulator) -> bool {
    let _ = emu.set_x(0, 1);
    return_from_stub(emu);
    false
}

fn stub_retnull(emu: &mut Emulator) -> bool {
    let _ = emu.set_x(0, 0);
    return_from_stub(emu);
    false
}

fn stub_retneg1(emu: &mut Emulator) -> bool {
    let _ = emu.set_x(0, u64::MAX);
    return_from_stub(emu);
    false
}

fn stub_void(emu: &mut Emulator) -> bool {
    return_from_stub(emu);
    false
}

fn stub_retx0(emu: &mut Emulator) -> bool {
    return_from_stub(emu);
    false
}

fn stub_retx1(emu: &mut Emulator) -> bool {
    let c = emu.x(0);
    let _ = emu.set_x(0, c);
    return_from_stub(emu);
    false
}

fn stub_path_ret0(emu: &mut Emulator) -> bool {
    let path = emu.mem_read_string(emu.x(0), 512).unwrap_or_default();
    stubs::log_call(emu, "libc", "fs-op", &path);
    let _ = emu.set_x(0, 0);
    return_from_stub(emu);
    false
}

fn stub_open(emu: &mut Emulator) -> bool {
    let path = emu.mem_read_string(emu.x(0), 512).unwrap_or_default();
    stubs::log_call(emu, "libc", "open", &path);
    let fd = alloc_fd(path);
    let _ = emu.set_x(0, fd);
    return_from_stub(emu);
    false
}

fn stub_openat(emu: &mut Emulator) -> bool {
    let path = emu.mem_read_string(emu.x(1), 512).unwrap_or_default();
    stubs::log_call(emu, "libc", "openat", &path);
    let fd = alloc_fd(path);
    let _ = emu.set_x(0, fd);
    return_from_stub(emu);
    false
}

fn stub_close(emu: &mut Emulator) -> bool {
    let fd = emu.x(0);
    let mut state = STATE.lock().unwrap();
    state.open.remove(&fd);
    state.pos.remove(&fd);
    drop(state);
    let _ = emu.set_x(0, 0);
    return_from_stub(emu);
    false
}

fn stub_read(emu: &mut Emulator) -> bool {
    // Everything reads as empty.
    let _ = emu.set_x(0, 0);
    return_from_stub(emu);
    false
}

fn stub_write(emu: &mut Emulator) -> bool {
    let count = emu.x(2);
    let _ = emu.set_x(0, count);
    return_from_stub(emu);
    false
}

fn stub_pwrite(emu: &mut Emulator) -> bool {
    let count = emu.x(2);
    let _ = emu.set_x(0, count);
    return_from_stub(emu);
    false
}

fn stub_readv(emu: &mut Emulator) -> bool {
    let _ = emu.set_x(0, 0);
    return_from_stub(emu);
    false
}

fn stub_writev(emu: &mut Emulator) -> bool {
    // Sum iov_len over the vector so the caller sees a full write.
    let iov = emu.x(1);
    let iovcnt = emu.x(2).min(64);
    let mut total = 0u64;
    for i in 0..iovcnt {
        total += emu.mem_read_u64(iov + i * 16 + 8).unwrap_or(0);
    }
    let _ = emu.set_x(0, total);
    return_from_stub(emu);
    false
}

fn stub_lseek(emu: &mut Emulator) -> bool {
    let fd = emu.x(0);
    let offset = emu.x(1);
    STATE.lock().unwrap().pos.insert(fd, offset);
    let _ = emu.set_x(0, offset);
    return_from_stub(emu);
    false
}

fn write_stat_buf(emu: &mut Emulator, buf: u64) {
    if buf == 0 {
        return;
    }
    // arm64 struct stat is 128+ bytes; zero it and mark a regular file.
    let _ = emu.mem_write(buf, &[0u8; 144]);
    let _ = emu.mem_write_u32(buf + 16, 0o100644); // st_mode
}

fn stub_stat(emu: &mut Emulator) -> bool {
    let path = emu.mem_read_string(emu.x(0), 512).unwrap_or_default();
    stubs::log_call(emu, "libc", "stat", &path);
    let buf = emu.x(1);
    write_stat_buf(emu, buf);
    let _ = emu.set_x(0, 0);
    return_from_stub(emu);
    false
}

fn stub_fstat(emu: &mut Emulator) -> bool {
    let buf = emu.x(1);
    write_stat_buf(emu, buf);
    let _ = emu.set_x(0, 0);
    return_from_stub(emu);
    false
}

fn stub_fstatat(emu: &mut Emulator) -> bool {
    let buf = emu.x(2);
    write_stat_buf(emu, buf);
    let _ = emu.set_x(0, 0);
    return_from_stub(emu);
    false
}

fn stub_dup(emu: &mut Emulator) -> bool {
    let fd = emu.x(0);
    let _ = emu.set_x(0, fd);
    return_from_stub(emu);
    false
}

fn stub_dup2(emu: &mut Emulator) -> bool {
    let newfd = emu.x(1);
    let _ = emu.set_x(0, newfd);
    return_from_stub(emu);
    false
}

fn stub_pipe(emu: &mut Emulator) -> bool {
    let fds = emu.x(0);
    if fds != 0 {
        let a = alloc_fd("pipe:r".to_string());
        let b = alloc_fd("pipe:w".to_string());
        let _ = emu.mem_write_u32(fds, a as u32);
        let _ = emu.mem_write_u32(fds + 4, b as u32);
    }
    let _ = emu.set_x(0, 0);
    return_from_stub(emu);
    false
}

fn stub_mmap(emu: &mut Emulator) -> bool {
    let len = emu.x(1);
    let ptr = emu.malloc(len.max(0x1000));
    stubs::log_call(emu, "libc", "mmap", &stubs::format_ptr_pair("len", len, "->", ptr));
    let _ = emu.set_x(0, ptr);
    return_from_stub(emu);
    false
}

fn stub_getcwd(emu: &mut Emulator) -> bool {
    let buf = emu.x(0);
    let cwd = "/data/data/com.app";
    if buf != 0 {
        let _ = emu.mem_write_string(buf, cwd);
        let _ = emu.set_x(0, buf);
    } else {
        let ptr = emu.malloc(cwd.len() as u64 + 1);
        let _ = emu.mem_write_string(ptr, cwd);
        let _ = emu.set_x(0, ptr);
    }
    return_from_stub(emu);
    false
}

fn stub_readdir_r(emu: &mut Emulator) -> bool {
    let result = emu.x(2);
    if result != 0 {
        let _ = emu.mem_write_u64(result, 0);
    }
    let _ = emu.set_x(0, 0);
    return_from_stub(emu);
    false
}

fn stub_realpath(emu: &mut Emulator) -> bool {
    let path = emu.mem_read_string(emu.x(0), 512).unwrap_or_default();
    let out = emu.x(1);
    let dest = if out != 0 {
        out
    } else {
        emu.malloc(path.len() as u64 + 1)
    };
    let _ = emu.mem_write_string(dest, &path);
    let _ = emu.set_x(0, dest);
    return_from_stub(emu);
    false
}

fn stub_umask(emu: &mut Emulator) -> bool {
    let _ = emu.set_x(0, 0o022);
    return_from_stub(emu);
    false
}

fn stub_mkstemp(emu: &mut Emulator) -> bool {
    let template = emu.mem_read_string(emu.x(0), 512).unwrap_or_default();
    let fd = alloc_fd(template);
    let _ = emu.set_x(0, fd);
    return_from_stub(emu);
    false
}

fn stub_mkdtemp(emu: &mut Emulator) -> bool {
    let template = emu.x(0);
    let _ = emu.set_x(0, template);
    return_from_stub(emu);
    false
}

fn stub_fwrite(emu: &mut Emulator) -> bool {
    let nmemb = emu.x(2);
    let _ = emu.set_x(0, nmemb);
    return_from_stub(emu);
    false
}

fn stub_fputs(emu: &mut Emulator) -> bool {
    let s = emu.mem_read_string(emu.x(0), 512).unwrap_or_default();
    stubs::log_call(emu, "libc", "fputs", &s);
    let _ = emu.set_x(0, 1);
    return_from_stub(emu);
    false
}

fn stub_puts(emu: &mut Emulator) -> bool {
    let s = emu.mem_read_string(emu.x(0), 512).unwrap_or_default();
    stubs::log_call(emu, "libc", "puts", &s);
    let _ = emu.set_x(0, s.len() as u64 + 1);
    return_from_stub(emu);
    false
}

fn stub_perror(emu: &mut Emulator) -> bool {
    let s = emu.mem_read_string(emu.x(0), 256).unwrap_or_default();
    stubs::log_call(emu, "libc", "perror", &s);
    return_from_stub(emu);
    false
}
