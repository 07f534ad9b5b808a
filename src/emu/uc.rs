//! Thin wrapper over the raw Unicorn FFI. All `unsafe` FFI traffic for the
//! emulator lives here; the rest of the crate goes through [`Uc`].

use anyhow::{Result, bail};
use core::ffi::c_void;
use std::ffi::CStr;
use std::mem::transmute;
use unicorn_engine_sys::{
    Arch, Mode, Prot, RegisterARM64, uc_cb_hookcode_t, uc_close, uc_emu_start, uc_emu_stop,
    uc_engine, uc_error, uc_hook, uc_hook_add, uc_mem_map, uc_mem_read, uc_mem_write, uc_open,
    uc_reg_read, uc_reg_write, uc_strerror, HookType,
};

pub struct Uc {
    pub raw: *mut uc_engine,
}

impl Uc {
    pub unsafe fn new_arm64() -> Result<Self> {
        let mut h: *mut uc_engine = std::ptr::null_mut();
        check(uc_open(Arch::ARM64, Mode::LITTLE_ENDIAN, &mut h))?;
        Ok(Self { raw: h })
    }

    pub unsafe fn map(&self, addr: u64, size: u64, prot: Prot) -> Result<()> {
        check(uc_mem_map(self.raw, addr, size, prot.0))?;
        Ok(())
    }

    pub unsafe fn read_bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        check(uc_mem_read(
            self.raw,
            addr,
            buf.as_mut_ptr() as *mut _,
            len as u64,
        ))?;
        Ok(buf)
    }

    pub unsafe fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        check(uc_mem_write(
            self.raw,
            addr,
            data.as_ptr() as *const _,
            data.len() as u64,
        ))?;
        Ok(())
    }

    pub unsafe fn reg_read(&self, reg: i32) -> Result<u64> {
        let mut val: u64 = 0;
        check(uc_reg_read(
            self.raw,
            reg,
            &mut val as *mut _ as *mut c_void,
        ))?;
        Ok(val)
    }

    pub unsafe fn reg_write(&self, reg: i32, val: u64) -> Result<()> {
        check(uc_reg_write(
            self.raw,
            reg,
            &val as *const _ as *const c_void,
        ))?;
        Ok(())
    }

    /// Installs a CODE hook covering `[begin, end]`. Unicorn treats
    /// `begin > end` as "every address".
    pub unsafe fn add_code_hook(
        &self,
        cb: uc_cb_hookcode_t,
        user: *mut c_void,
        begin: u64,
        end: u64,
    ) -> Result<uc_hook> {
        let mut h: uc_hook = 0;
        let cb_ptr: *mut c_void = transmute(cb);
        check(uc_hook_add(
            self.raw,
            &mut h,
            HookType::CODE.0 as i32,
            cb_ptr,
            user,
            begin,
            end,
        ))?;
        Ok(h)
    }

    pub unsafe fn start(&self, begin: u64, until: u64) -> Result<()> {
        check(uc_emu_start(self.raw, begin, until, 0, 0))?;
        Ok(())
    }

    pub unsafe fn emu_stop(&self) -> Result<()> {
        check(uc_emu_stop(self.raw))?;
        Ok(())
    }
}

impl Drop for Uc {
    fn drop(&mut self) {
        unsafe {
            let _ = uc_close(self.raw);
        }
    }
}

pub fn check(e: uc_error) -> Result<()> {
    if e == uc_error::OK {
        return Ok(());
    }
    unsafe {
        let s = CStr::from_ptr(uc_strerror(e));
        bail!("unicorn error: {}", s.to_string_lossy())
    }
}

/// Register id for general-purpose register Xn. X29 and X30 are the frame
/// pointer and link register in Unicorn's enum.
pub fn xreg(n: usize) -> i32 {
    match n {
        0..=28 => RegisterARM64::X0 as i32 + n as i32,
        29 => RegisterARM64::FP as i32,
        30 => RegisterARM64::LR as i32,
        _ => unreachable!("invalid register X{n}"),
    }
}

pub fn sp_reg() -> i32 {
    RegisterARM64::SP as i32
}

pub fn pc_reg() -> i32 {
    RegisterARM64::PC as i32
}

pub fn lr_reg() -> i32 {
    RegisterARM64::LR as i32
}

pub fn tpidr_el0_reg() -> i32 {
    RegisterARM64::TPIDR_EL0 as i32
}
