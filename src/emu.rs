//! ARM64 emulation core: fixed address-space layout, register and memory
//! helpers, the bump heap, and the mock C++ object graph that keeps guest
//! code from wandering into unmapped memory.

pub mod elf;
pub mod uc;
pub mod vtable;

#[cfg(test)]
mod tests;

use anyhow::{Context, Result, bail};
use core::ffi::c_void;
use std::collections::HashMap;
use std::rc::Rc;
use unicorn_engine_sys::{Prot, uc_engine};

use self::uc::{Uc, lr_reg, pc_reg, sp_reg, tpidr_el0_reg, xreg};

// Memory layout. These addresses are part of the loader/stub contract and
// must not drift: relocated guest pointers reference them directly.
pub const CODE_BASE: u64 = 0x0001_0000;
pub const CODE_SIZE: u64 = 0x0100_0000; // 16 MiB scratch code
pub const STACK_BASE: u64 = 0x8000_0000;
pub const STACK_SIZE: u64 = 0x0010_0000; // 1 MiB stack
pub const HEAP_BASE: u64 = 0x9000_0000;
pub const HEAP_SIZE: u64 = 0x1000_0000; // 256 MiB bump heap
pub const MOCK_OBJ_BASE: u64 = 0xDEAB_0000; // mock C++ objects (this pointers)
pub const MOCK_OBJ_SIZE: u64 = 0x0001_0000;
pub const TLS_BASE: u64 = 0xDEAC_0000;
pub const TLS_SIZE: u64 = 0x0001_0000;
pub const LIBC_BASE: u64 = 0xDEAD_0000; // mock libc globals (_ctype_, etc.)
pub const LIBC_SIZE: u64 = 0x0001_0000;
pub const STUB_BASE: u64 = 0xF000_0000; // synthesized stub bodies
pub const STUB_SIZE: u64 = 0x0010_0000;

// Libc global sub-layout.
pub const CTYPE_TABLE_OFFSET: u64 = 0x0000; // 257 bytes, index -1 through 255
pub const CTYPE_PTR_OFFSET: u64 = 0x0200; // points at table+1
pub const EMPTY_STRING_REP_OFFSET: u64 = 0x0300; // libstdc++ COW _Rep
pub const EMPTY_STRING_DATA_OFFSET: u64 = 0x0318; // _Rep + 24

pub const VTABLE_STUB_COUNT: u64 = 256;

/// LR sentinel for top-level returns. Lands inside the mapped libc-globals
/// page so a pre-execution hook can stop the run cleanly.
pub const SENTINEL: u64 = 0xDEAD_BEEF;

/// ARM64 `RET` encoding, little endian.
pub const RET_INSN: [u8; 4] = [0xc0, 0x03, 0x5f, 0xd6];

const STACK_CANARY: u64 = 0xDEAD_BEEF_DEAD_BEEF;

/// Hook fired when execution reaches a specific address. Returning true
/// stops emulation.
pub type AddressHook = Rc<dyn Fn(&mut Emulator) -> bool>;

/// Hook fired for every retired instruction.
pub type CodeHook = Rc<dyn Fn(&mut Emulator, u64, u32)>;

pub struct Emulator {
    uc: Uc,
    heap_ptr: u64,
    addr_hooks: HashMap<u64, AddressHook>,
    code_hooks: Vec<CodeHook>,
    stopped: bool,
    empty_string_data: u64,
}

impl Emulator {
    /// Creates the emulator, maps the fixed regions and primes ABI state.
    /// Boxed because the hook dispatch trampoline keeps a raw pointer to it.
    pub fn new() -> Result<Box<Emulator>> {
        let uc = unsafe { Uc::new_arm64().context("create unicorn")? };

        let mut emu = Box::new(Emulator {
            uc,
            heap_ptr: HEAP_BASE,
            addr_hooks: HashMap::new(),
            code_hooks: Vec::new(),
            stopped: false,
            empty_string_data: 0,
        });

        emu.map_memory()?;

        let user = &mut *emu as *mut Emulator as *mut c_void;
        unsafe {
            emu.uc.add_code_hook(Some(dispatch_hook), user, 1, 0)?;
        }

        Ok(emu)
    }

    fn map_memory(&mut self) -> Result<()> {
        let regions: [(u64, u64, &str); 7] = [
            (CODE_BASE, CODE_SIZE, "code"),
            (STACK_BASE, STACK_SIZE, "stack"),
            (HEAP_BASE, HEAP_SIZE, "heap"),
            (MOCK_OBJ_BASE, MOCK_OBJ_SIZE, "mockobj"),
            (TLS_BASE, TLS_SIZE, "tls"),
            (LIBC_BASE, LIBC_SIZE, "libc"),
            (STUB_BASE, STUB_SIZE, "stubs"),
        ];
        for (base, size, name) in regions {
            unsafe {
                self.uc
                    .map(base, size, Prot::ALL)
                    .with_context(|| format!("map {name} (0x{base:x})"))?;
            }
        }

        let sp = STACK_BASE + STACK_SIZE - 0x1000;
        self.set_sp(sp).context("set SP")?;

        // Seed the top of the stack with mock-vtable pointers. Uninitialized
        // stack slots read as a valid object with working RTTI instead of
        // garbage.
        let mock_vtable = MOCK_OBJ_BASE + 0x1010;
        let fill_size = 0x10000u64;
        let mut fill = Vec::with_capacity(fill_size as usize);
        for _ in 0..fill_size / 8 {
            fill.extend_from_slice(&mock_vtable.to_le_bytes());
        }
        let _ = self.mem_write(STACK_BASE + STACK_SIZE - fill_size, &fill);

        unsafe {
            self.uc
                .reg_write(tpidr_el0_reg(), TLS_BASE)
                .context("set TPIDR_EL0")?;
        }
        self.mem_write(TLS_BASE, &[0u8; 256]).context("init TLS")?;

        // Stack canary at TLS+0x28, where __stack_chk_guard is redirected.
        self.mem_write_u64(TLS_BASE + 0x28, STACK_CANARY)
            .context("set stack canary")?;

        let ctype = build_ctype_table();
        self.mem_write(LIBC_BASE + CTYPE_TABLE_OFFSET, &ctype)
            .context("init _ctype_ table")?;
        self.mem_write_u64(
            LIBC_BASE + CTYPE_PTR_OFFSET,
            LIBC_BASE + CTYPE_TABLE_OFFSET + 1,
        )
        .context("init _ctype_ pointer")?;

        // Immortal empty libstdc++ COW string: _Rep { len=0, cap=0,
        // refcount=-1 } followed by a NUL byte at +24.
        let mut empty_rep = [0u8; 32];
        empty_rep[16..20].copy_from_slice(&(-1i32).to_le_bytes());
        self.mem_write(LIBC_BASE + EMPTY_STRING_REP_OFFSET, &empty_rep)
            .context("init empty string rep")?;
        self.empty_string_data = LIBC_BASE + EMPTY_STRING_DATA_OFFSET;

        self.init_mock_objects()?;

        Ok(())
    }

    /// Builds the mock object graph:
    ///
    ///   +0x0800 mock_typeinfo    (Itanium type_info, name "12_MockObject")
    ///   +0x1000 RTTI prefix      (offset_to_top, type_info*)
    ///   +0x1010 mock_vtable      (256 slots, each a hooked RET stub)
    ///   +0x2000 mock_obj         (vptr + member pointers to mock_obj2)
    ///   +0x3000 mock_obj2        (vptr + member pointers to callback stubs,
    ///                             itself callable via RET words)
    ///   +0x4000 vtable_stubs     (256 x RET)
    ///   +0x5000 callback_stubs   (256 x RET)
    ///
    /// Every pointer reachable in a few dereferences from mock_obj is either
    /// another mock object or an executable stub that returns to LR.
    fn init_mock_objects(&mut self) -> Result<()> {
        let mock_typeinfo = MOCK_OBJ_BASE + 0x0800;
        let rtti_prefix = MOCK_OBJ_BASE + 0x1000;
        let mock_vtable = MOCK_OBJ_BASE + 0x1010;
        let mock_obj = MOCK_OBJ_BASE + 0x2000;
        let mock_obj2 = MOCK_OBJ_BASE + 0x3000;
        let vtable_stubs = MOCK_OBJ_BASE + 0x4000;
        let callback_stubs = MOCK_OBJ_BASE + 0x5000;

        let typeinfo_name = mock_typeinfo + 0x100;
        self.mem_write(typeinfo_name, b"12_MockObject\0")
            .context("write type_info name")?;
        self.mem_write_u64(mock_typeinfo, mock_vtable)?;
        self.mem_write_u64(mock_typeinfo + 8, typeinfo_name)?;

        self.mem_write_u64(rtti_prefix, 0)?; // offset_to_top
        self.mem_write_u64(rtti_prefix + 8, mock_typeinfo)?;

        for i in 0..VTABLE_STUB_COUNT {
            let stub = vtable_stubs + i * 4;
            self.mem_write(stub, &RET_INSN)
                .with_context(|| format!("write vtable stub {i}"))?;
            self.mem_write_u64(mock_vtable + i * 8, stub)?;
            self.addr_hooks.insert(stub, make_vtable_stub_hook());
        }

        for i in 0..VTABLE_STUB_COUNT {
            let stub = callback_stubs + i * 4;
            self.mem_write(stub, &RET_INSN)
                .with_context(|| format!("write callback stub {i}"))?;
            self.addr_hooks.insert(stub, make_callback_stub_hook());
        }

        // mock_obj2 doubles as code: guest binaries sometimes load a member
        // pointer and blr straight into it.
        for i in 0..VTABLE_STUB_COUNT {
            let addr = mock_obj2 + i * 4;
            self.mem_write(addr, &RET_INSN)?;
            self.addr_hooks.insert(
                addr,
                Rc::new(move |e: &mut Emulator| {
                    let _ = e.set_x(0, mock_obj);
                    false
                }),
            );
        }

        self.mem_write_u64(mock_obj, mock_vtable)?;
        for i in 1..VTABLE_STUB_COUNT {
            let _ = self.mem_write_u64(mock_obj + i * 8, mock_obj2);
            let callback = callback_stubs + (i % VTABLE_STUB_COUNT) * 4;
            let _ = self.mem_write_u64(mock_obj2 + i * 8, callback);
        }
        // The fill loop clobbered offset 0; the vptr must win.
        self.mem_write_u64(mock_obj2, mock_vtable)?;

        Ok(())
    }

    /// The default `this` pointer for member-method entry points.
    pub fn get_mock_object(&self) -> u64 {
        MOCK_OBJ_BASE + 0x2000
    }

    /// Base of the 256 vtable stub bodies.
    pub fn get_vtable_stubs(&self) -> u64 {
        MOCK_OBJ_BASE + 0x4000
    }

    /// Address of the `_ctype_` pointer variable.
    pub fn get_ctype_ptr(&self) -> u64 {
        LIBC_BASE + CTYPE_PTR_OFFSET
    }

    /// Data pointer of the shared empty COW string.
    pub fn get_empty_string_data(&self) -> u64 {
        self.empty_string_data
    }

    pub fn map_region(&mut self, addr: u64, size: u64) -> Result<()> {
        unsafe { self.uc.map(addr, size, Prot::ALL) }
    }

    /// Writes scratch code at the code base.
    pub fn load_code(&mut self, code: &[u8]) -> Result<()> {
        self.mem_write(CODE_BASE, code)
    }

    pub fn mem_read(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        unsafe { self.uc.read_bytes(addr, size) }
    }

    pub fn mem_write(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        unsafe { self.uc.write(addr, data) }
    }

    pub fn mem_read_u64(&self, addr: u64) -> Result<u64> {
        let b = self.mem_read(addr, 8)?;
        Ok(u64::from_le_bytes(b[..8].try_into().unwrap()))
    }

    pub fn mem_write_u64(&mut self, addr: u64, val: u64) -> Result<()> {
        self.mem_write(addr, &val.to_le_bytes())
    }

    pub fn mem_read_u32(&self, addr: u64) -> Result<u32> {
        let b = self.mem_read(addr, 4)?;
        Ok(u32::from_le_bytes(b[..4].try_into().unwrap()))
    }

    pub fn mem_write_u32(&mut self, addr: u64, val: u32) -> Result<()> {
        self.mem_write(addr, &val.to_le_bytes())
    }

    pub fn mem_read_u16(&self, addr: u64) -> Result<u16> {
        let b = self.mem_read(addr, 2)?;
        Ok(u16::from_le_bytes(b[..2].try_into().unwrap()))
    }

    pub fn mem_write_u16(&mut self, addr: u64, val: u16) -> Result<()> {
        self.mem_write(addr, &val.to_le_bytes())
    }

    pub fn mem_read_u8(&self, addr: u64) -> Result<u8> {
        Ok(self.mem_read(addr, 1)?[0])
    }

    pub fn mem_write_u8(&mut self, addr: u64, val: u8) -> Result<()> {
        self.mem_write(addr, &[val])
    }

    /// Reads a NUL-terminated string, at most `max_len` bytes. Invalid UTF-8
    /// is replaced rather than rejected; printability gates happen at the
    /// capture sites.
    pub fn mem_read_string(&self, addr: u64, max_len: usize) -> Result<String> {
        let max_len = if max_len == 0 { 4096 } else { max_len };
        let data = self.mem_read(addr, max_len)?;
        let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        Ok(String::from_utf8_lossy(&data[..end]).into_owned())
    }

    pub fn mem_write_string(&mut self, addr: u64, s: &str) -> Result<()> {
        let mut data = s.as_bytes().to_vec();
        data.push(0);
        self.mem_write(addr, &data)
    }

    /// Reads general-purpose register Xn. Out-of-range or failed reads
    /// yield 0, matching how stub code probes argument registers.
    pub fn x(&self, n: usize) -> u64 {
        if n > 30 {
            return 0;
        }
        unsafe { self.uc.reg_read(xreg(n)).unwrap_or(0) }
    }

    pub fn set_x(&mut self, n: usize, val: u64) -> Result<()> {
        if n > 30 {
            bail!("invalid register X{n}");
        }
        unsafe { self.uc.reg_write(xreg(n), val) }
    }

    pub fn pc(&self) -> u64 {
        unsafe { self.uc.reg_read(pc_reg()).unwrap_or(0) }
    }

    pub fn set_pc(&mut self, val: u64) -> Result<()> {
        unsafe { self.uc.reg_write(pc_reg(), val) }
    }

    pub fn sp(&self) -> u64 {
        unsafe { self.uc.reg_read(sp_reg()).unwrap_or(0) }
    }

    pub fn set_sp(&mut self, val: u64) -> Result<()> {
        unsafe { self.uc.reg_write(sp_reg(), val) }
    }

    pub fn lr(&self) -> u64 {
        unsafe { self.uc.reg_read(lr_reg()).unwrap_or(0) }
    }

    pub fn set_lr(&mut self, val: u64) -> Result<()> {
        unsafe { self.uc.reg_write(lr_reg(), val) }
    }

    /// Bump allocation from the guest heap, 16-byte aligned.
    ///
    /// Panics on exhaustion. Running out of 256 MiB means stubs are leaking
    /// without bound and no recovery produces a meaningful run.
    pub fn malloc(&mut self, size: u64) -> u64 {
        let size = (size + 15) & !15u64;
        let addr = self.heap_ptr;
        self.heap_ptr += size;
        if self.heap_ptr >= HEAP_BASE + HEAP_SIZE {
            panic!("guest heap exhausted");
        }
        addr
    }

    /// Attaches a pre-execution hook at `addr`, replacing any existing one.
    pub fn hook_address(&mut self, addr: u64, hook: AddressHook) {
        self.addr_hooks.insert(addr, hook);
    }

    pub fn remove_address_hook(&mut self, addr: u64) {
        self.addr_hooks.remove(&addr);
    }

    pub fn has_address_hook(&self, addr: u64) -> bool {
        self.addr_hooks.contains_key(&addr)
    }

    /// Adds a hook fired before every instruction.
    pub fn hook_code(&mut self, hook: CodeHook) {
        self.code_hooks.push(hook);
    }

    /// Runs from `start` until PC reaches `end`, a stop is requested, or the
    /// guest faults.
    pub fn run(&mut self, start: u64, end: u64) -> Result<()> {
        self.stopped = false;
        unsafe { self.uc.start(start, end) }
    }

    /// Runs from `start` until stop or fault.
    pub fn run_from(&mut self, start: u64) -> Result<()> {
        self.stopped = false;
        unsafe { self.uc.start(start, 0) }
    }

    pub fn stop(&mut self) {
        self.stopped = true;
        unsafe {
            let _ = self.uc.emu_stop();
        }
    }
}

/// Per-instruction dispatch: address hooks first, then code hooks. Runs on
/// the emulation thread between instructions, so hooks observe a consistent
/// register and memory snapshot.
unsafe extern "C" fn dispatch_hook(_uc: *mut uc_engine, addr: u64, size: u32, user: *mut c_void) {
    let emu = &mut *(user as *mut Emulator);

    if emu.stopped {
        let _ = emu.uc.emu_stop();
        return;
    }

    if let Some(hook) = emu.addr_hooks.get(&addr).cloned() {
        if hook(emu) {
            emu.stop();
            return;
        }
    }

    if !emu.code_hooks.is_empty() {
        let hooks = emu.code_hooks.clone();
        for h in &hooks {
            h(emu, addr, size);
        }
    }
}

/// Hook behind every vtable stub. A virtual call that returns a non-trivial
/// value passes the result buffer in X8; when X8 points into the stack we
/// materialize an empty COW string there so later c_str()/size() calls work.
fn make_vtable_stub_hook() -> AddressHook {
    Rc::new(|emu: &mut Emulator| {
        let x8 = emu.x(8);
        if (STACK_BASE..STACK_BASE + STACK_SIZE).contains(&x8) {
            write_empty_cow_string(emu, x8);
            let _ = emu.set_x(0, x8);
        } else {
            let _ = emu.set_x(0, emu.get_mock_object());
        }
        false
    })
}

/// Same return-buffer handling for calls through member function pointers,
/// but plain calls return 0 instead of the mock object.
fn make_callback_stub_hook() -> AddressHook {
    Rc::new(|emu: &mut Emulator| {
        let x8 = emu.x(8);
        if (STACK_BASE..STACK_BASE + STACK_SIZE).contains(&x8) {
            write_empty_cow_string(emu, x8);
            let _ = emu.set_x(0, x8);
        } else {
            let _ = emu.set_x(0, 0);
        }
        false
    })
}

/// Allocates a `_Rep { len=0, cap=15, refcount=0 }` plus 16 data bytes and
/// stores the data pointer through `obj`.
fn write_empty_cow_string(emu: &mut Emulator, obj: u64) {
    let rep_size = 24u64;
    let data_size = 16u64;
    let rep = emu.malloc(rep_size + data_size);
    let data = rep + rep_size;

    let mut header = [0u8; 24];
    header[8..16].copy_from_slice(&15u64.to_le_bytes());
    let _ = emu.mem_write(rep, &header);
    let _ = emu.mem_write(data, &[0u8; 16]);
    let _ = emu.mem_write_u64(obj, data);
}

/// Character classification table in the bionic format: 257 bytes, byte 0 is
/// EOF (-1), bytes 1..256 cover character values 0..255.
pub fn build_ctype_table() -> [u8; 257] {
    const U: u8 = 0x01;
    const L: u8 = 0x02;
    const N: u8 = 0x04;
    const S: u8 = 0x08;
    const P: u8 = 0x10;
    const C: u8 = 0x20;
    const B: u8 = 0x40;
    const X: u8 = 0x80;

    let mut table = [0u8; 257];
    for i in 0..256u32 {
        let c = i as u8;
        let flags = match c {
            b'A'..=b'F' => U | X,
            b'G'..=b'Z' => U,
            b'a'..=b'f' => L | X,
            b'g'..=b'z' => L,
            b'0'..=b'9' => N | X,
            b' ' | b'\t' => S | B,
            b'\n' | b'\r' | 0x0c | 0x0b => S,
            0x00..=0x1f | 0x7f => C,
            0x21..=0x2f | 0x3a..=0x40 | 0x5b..=0x60 | 0x7b..=0x7e => P,
            _ => 0,
        };
        table[i as usize + 1] = flags;
    }
    table
}
