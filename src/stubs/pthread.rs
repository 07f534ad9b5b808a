//! pthread stubs. The guest is single-threaded under emulation, so locking
//! always succeeds, created threads never run, and TLS is a flat map.

use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::emu::Emulator;
use crate::stubs::{self, DEFAULT_REGISTRY, format_ptr, return_from_stub};

struct TlsState {
    next_key: u64,
    values: HashMap<u64, u64>,
    once: HashSet<u64>,
}

static TLS: Lazy<Mutex<TlsState>> = Lazy::new(|| {
    Mutex::new(TlsState {
        next_key: 1,
        values: HashMap::new(),
        once: HashSet::new(),
    })
});

pub(crate) fn register() {
    let r = &*DEFAULT_REGISTRY;

    // Mutexes, rwlocks, spinlocks and condition variables all succeed
    // immediately.
    for name in [
        "pthread_mutex_init",
        "pthread_mutex_destroy",
        "pthread_mutex_lock",
        "pthread_mutex_trylock",
        "pthread_mutex_unlock",
        "pthread_mutexattr_init",
        "pthread_mutexattr_settype",
        "pthread_mutexattr_destroy",
        "pthread_cond_init",
        "pthread_cond_destroy",
        "pthread_cond_signal",
        "pthread_cond_broadcast",
        "pthread_cond_wait",
        "pthread_cond_timedwait",
        "pthread_condattr_init",
        "pthread_condattr_destroy",
        "pthread_rwlock_init",
        "pthread_rwlock_destroy",
        "pthread_rwlock_rdlock",
        "pthread_rwlock_wrlock",
        "pthread_rwlock_unlock",
        "pthread_spin_init",
        "pthread_spin_destroy",
        "pthread_spin_lock",
        "pthread_spin_unlock",
        "pthread_attr_init",
        "pthread_attr_destroy",
        "pthread_attr_setdetachstate",
        "pthread_attr_getdetachstate",
        "pthread_attr_setstacksize",
        "pthread_attr_getstacksize",
        "pthread_attr_setschedparam",
        "pthread_attr_getschedparam",
        "pthread_detach",
        "pthread_join",
        "pthread_cancel",
        "pthread_setname_np",
        "pthread_getname_np",
        "sched_yield",
    ] {
        r.register_func("pthread", name, stub_ret0);
    }

    r.register_func("pthread", "pthread_create", stub_create);
    r.register_func("pthread", "pthread_exit", stub_exit);
    r.register_func("pthread", "pthread_self", stub_self);
    r.register_func("pthread", "pthread_equal", stub_equal);

    r.register_func("pthread", "pthread_key_create", stub_key_create);
    r.register_func("pthread", "pthread_key_delete", stub_key_delete);
    r.register_func("pthread", "pthread_setspecific", stub_setspecific);
    r.register_func("pthread", "pthread_getspecific", stub_getspecific);
    r.register_func("pthread", "pthread_once", stub_once);
}

fn stub_ret0(emu: &mut Emulator) -> bool {
    let _ = emu.set_x(0, 0);
    return_from_stub(emu);
    false
}

/// The start routine is never scheduled. Games spawn watchdogs and loaders
/// here that only get in the way of reaching the key setter.
fn stub_create(emu: &mut Emulator) -> bool {
    let thread_out = emu.x(0);
    let start = emu.x(2);
    stubs::log_call(
        emu,
        "pthread",
        "pthread_create",
        &format!("{} (not scheduled)", format_ptr("start", start)),
    );
    if thread_out != 0 {
        let _ = emu.mem_write_u64(thread_out, 0x7000_0001);
    }
    let _ = emu.set_x(0, 0);
    return_from_stub(emu);
    false
}

fn stub_exit(emu: &mut Emulator) -> bool {
    stubs::log_call(emu, "pthread", "pthread_exit", "");
    true
}

fn stub_self(emu: &mut Emulator) -> bool {
    let _ = emu.set_x(0, 0x7000_0001);
    return_from_stub(emu);
    false
}

fn stub_equal(emu: &mut Emulator) -> bool {
    let eq = emu.x(0) == emu.x(1);
    let _ = emu.set_x(0, eq as u64);
    return_from_stub(emu);
    false
}

fn stub_key_create(emu: &mut Emulator) -> bool {
    let key_ptr = emu.x(0);
    let key = {
        let mut tls = TLS.lock().unwrap();
        let key = tls.next_key;
        tls.next_key += 1;
        key
    };
    if key_ptr != 0 {
        let _ = emu.mem_write_u64(key_ptr, key);
    }
    let _ = emu.set_x(0, 0);
    return_from_stub(emu);
    false
}

fn stub_key_delete(emu: &mut Emulator) -> bool {
    let key = emu.x(0);
    TLS.lock().unwrap().values.remove(&key);
    let _ = emu.set_x(0, 0);
    return_from_stub(emu);
    false
}

fn stub_setspecific(emu: &mut Emulator) -> bool {
    let key = emu.x(0);
    let value = emu.x(1);
    TLS.lock().unwrap().values.insert(key, value);
    let _ = emu.set_x(0, 0);
    return_from_stub(emu);
    false
}

fn stub_getspecific(emu: &mut Emulator) -> bool {
    let key = emu.x(0);
    let value = TLS.lock().unwrap().values.get(&key).copied().unwrap_or(0);
    let _ = emu.set_x(0, value);
    return_from_stub(emu);
    false
}

/// The once-flag is honored but the init routine is skipped, not called.
fn stub_once(emu: &mut Emulator) -> bool {
    let control = emu.x(0);
    let init = emu.x(1);
    let first = TLS.lock().unwrap().once.insert(control);
    if first && init != 0 {
        stubs::log_call(
            emu,
            "pthread",
            "pthread_once",
            &format!("{} (skipped)", format_ptr("init_routine", init)),
        );
    }
    let _ = emu.set_x(0, 0);
    return_from_stub(emu);
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_key_round_trip() {
        let mut emu = Emulator::new().unwrap();
        emu.set_lr(crate::emu::SENTINEL).unwrap();
        let key_slot = emu.malloc(8);

        emu.set_x(0, key_slot).unwrap();
        stub_key_create(&mut emu);
        assert_eq!(emu.x(0), 0);
        let key = emu.mem_read_u64(key_slot).unwrap();

        emu.set_x(0, key).unwrap();
        emu.set_x(1, 0xABCD).unwrap();
        stub_setspecific(&mut emu);

        emu.set_x(0, key).unwrap();
        stub_getspecific(&mut emu);
        assert_eq!(emu.x(0), 0xABCD);

        emu.set_x(0, key).unwrap();
        stub_key_delete(&mut emu);
        emu.set_x(0, key).unwrap();
        stub_getspecific(&mut emu);
        assert_eq!(emu.x(0), 0);
    }
}
