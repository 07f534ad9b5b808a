//! Time stubs pinned to a fixed instant so runs are reproducible.

use crate::emu::Emulator;
use crate::stubs::{self, DEFAULT_REGISTRY, format_ptr_pair, return_from_stub};

/// 2024-01-01 00:00:00 UTC.
pub const MOCK_TIME_SEC: u64 = 1_704_067_200;
pub const MOCK_TIME_USEC: u64 = 0;
pub const MOCK_TIME_NSEC: u64 = 0;

pub(crate) fn register() {
    DEFAULT_REGISTRY.register_func("libc", "gettimeofday", stub_gettimeofday);
    DEFAULT_REGISTRY.register_func("libc", "clock_gettime", stub_clock_gettime);
    DEFAULT_REGISTRY.register_func("libc", "time", stub_time);
    DEFAULT_REGISTRY.register_func("libc", "clock", stub_clock);
    DEFAULT_REGISTRY.register_func("libc", "nanosleep", stub_sleep0);
    DEFAULT_REGISTRY.register_func("libc", "usleep", stub_sleep0);
    DEFAULT_REGISTRY.register_func("libc", "sleep", stub_sleep0);
}

fn stub_gettimeofday(emu: &mut Emulator) -> bool {
    let tv = emu.x(0);
    if tv != 0 {
        // struct timeval { time_t tv_sec; suseconds_t tv_usec; }
        let _ = emu.mem_write_u64(tv, MOCK_TIME_SEC);
        let _ = emu.mem_write_u64(tv + 8, MOCK_TIME_USEC);
    }
    stubs::log_call(
        emu,
        "libc",
        "gettimeofday",
        &format_ptr_pair("tv", tv, "sec", MOCK_TIME_SEC),
    );
    let _ = emu.set_x(0, 0);
    return_from_stub(emu);
    false
}

fn stub_clock_gettime(emu: &mut Emulator) -> bool {
    let tp = emu.x(1);
    if tp != 0 {
        // struct timespec { time_t tv_sec; long tv_nsec; }
        let _ = emu.mem_write_u64(tp, MOCK_TIME_SEC);
        let _ = emu.mem_write_u64(tp + 8, MOCK_TIME_NSEC);
    }
    stubs::log_call(
        emu,
        "libc",
        "clock_gettime",
        &format_ptr_pair("tp", tp, "sec", MOCK_TIME_SEC),
    );
    let _ = emu.set_x(0, 0);
    return_from_stub(emu);
    false
}

fn stub_time(emu: &mut Emulator) -> bool {
    let tloc = emu.x(0);
    if tloc != 0 {
        let _ = emu.mem_write_u64(tloc, MOCK_TIME_SEC);
    }
    let _ = emu.set_x(0, MOCK_TIME_SEC);
    return_from_stub(emu);
    false
}

fn stub_clock(emu: &mut Emulator) -> bool {
    let _ = emu.set_x(0, 1_000_000);
    return_from_stub(emu);
    false
}

fn stub_sleep0(emu: &mut Emulator) -> bool {
    let _ = emu.set_x(0, 0);
    return_from_stub(emu);
    false
}
