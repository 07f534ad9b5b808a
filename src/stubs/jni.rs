//! JNI and JavaVM mock environment.
//!
//! When a binary looks like it will call into Java, two function tables are
//! materialized inside the stub region: a 300-slot JNIEnv vtable and a
//! 10-slot JavaVM vtable, each slot backed by its own hooked RET stub.
//! References handed out for classes, methods, fields and strings are
//! monotone ids interned per name so guest-side caching behaves.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::emu::{Emulator, RET_INSN, STUB_BASE};
use crate::stubs::{self, DEFAULT_REGISTRY, Detector, return_from_stub};

pub const JNI_OK: u64 = 0;
pub const JNI_VERSION_1_6: u64 = 0x0001_0006;

// JNIEnv function indices (offset/8 in JNINativeInterface).
pub const JNI_GET_VERSION: usize = 4;
pub const JNI_FIND_CLASS: usize = 6;
pub const JNI_EXCEPTION_OCCURRED: usize = 15;
pub const JNI_EXCEPTION_DESCRIBE: usize = 16;
pub const JNI_EXCEPTION_CLEAR: usize = 17;
pub const JNI_PUSH_LOCAL_FRAME: usize = 19;
pub const JNI_POP_LOCAL_FRAME: usize = 20;
pub const JNI_NEW_GLOBAL_REF: usize = 21;
pub const JNI_DELETE_GLOBAL_REF: usize = 22;
pub const JNI_DELETE_LOCAL_REF: usize = 23;
pub const JNI_IS_SAME_OBJECT: usize = 24;
pub const JNI_NEW_LOCAL_REF: usize = 25;
pub const JNI_ENSURE_LOCAL_CAPACITY: usize = 26;
pub const JNI_GET_OBJECT_CLASS: usize = 31;
pub const JNI_GET_METHOD_ID: usize = 33;
pub const JNI_CALL_OBJECT_METHOD: usize = 34;
pub const JNI_CALL_BOOLEAN_METHOD: usize = 37;
pub const JNI_CALL_INT_METHOD: usize = 49;
pub const JNI_CALL_LONG_METHOD: usize = 52;
pub const JNI_CALL_VOID_METHOD: usize = 61;
pub const JNI_GET_FIELD_ID: usize = 94;
pub const JNI_GET_OBJECT_FIELD: usize = 95;
pub const JNI_GET_BOOLEAN_FIELD: usize = 96;
pub const JNI_GET_INT_FIELD: usize = 100;
pub const JNI_GET_LONG_FIELD: usize = 101;
pub const JNI_SET_OBJECT_FIELD: usize = 104;
pub const JNI_SET_BOOLEAN_FIELD: usize = 105;
pub const JNI_SET_INT_FIELD: usize = 109;
pub const JNI_SET_LONG_FIELD: usize = 110;
pub const JNI_GET_STATIC_METHOD_ID: usize = 113;
pub const JNI_CALL_STATIC_OBJECT_METHOD: usize = 114;
pub const JNI_CALL_STATIC_BOOLEAN_METHOD: usize = 117;
pub const JNI_CALL_STATIC_INT_METHOD: usize = 129;
pub const JNI_CALL_STATIC_LONG_METHOD: usize = 132;
pub const JNI_CALL_STATIC_VOID_METHOD: usize = 141;
pub const JNI_GET_STATIC_FIELD_ID: usize = 144;
pub const JNI_GET_STATIC_OBJECT_FIELD: usize = 145;
pub const JNI_GET_STATIC_BOOLEAN_FIELD: usize = 146;
pub const JNI_GET_STATIC_INT_FIELD: usize = 150;
pub const JNI_GET_STATIC_LONG_FIELD: usize = 151;
pub const JNI_NEW_STRING_UTF: usize = 167;
pub const JNI_GET_STRING_UTF_LENGTH: usize = 168;
pub const JNI_GET_STRING_UTF_CHARS: usize = 169;
pub const JNI_RELEASE_STRING_UTF_CHARS: usize = 170;
pub const JNI_GET_ARRAY_LENGTH: usize = 171;
pub const JNI_NEW_BYTE_ARRAY: usize = 176;
pub const JNI_GET_BYTE_ARRAY_ELEMENTS: usize = 184;
pub const JNI_RELEASE_BYTE_ARRAY_ELEMENTS: usize = 192;
pub const JNI_REGISTER_NATIVES: usize = 215;
pub const JNI_MONITOR_ENTER: usize = 217;
pub const JNI_MONITOR_EXIT: usize = 218;
pub const JNI_GET_JAVA_VM: usize = 219;
pub const JNI_NEW_WEAK_GLOBAL_REF: usize = 226;
pub const JNI_DELETE_WEAK_GLOBAL_REF: usize = 227;
pub const JNI_EXCEPTION_CHECK: usize = 228;
pub const JNI_FUNC_COUNT: usize = 300;

// JavaVM function indices.
pub const JAVAVM_DESTROY: usize = 0;
pub const JAVAVM_ATTACH_CURRENT_THREAD: usize = 1;
pub const JAVAVM_DETACH_CURRENT_THREAD: usize = 2;
pub const JAVAVM_GET_ENV: usize = 3;
pub const JAVAVM_ATTACH_AS_DAEMON: usize = 4;
pub const JAVAVM_FUNC_COUNT: usize = 10;

/// Mock Java environment state. Singleton per emulation session.
pub struct Env {
    jni_env_base: u64,
    jni_vtable_base: u64,
    jni_stub_base: u64,
    java_vm_base: u64,
    java_vm_vtable: u64,
    java_vm_stub_base: u64,
    mock_obj_base: u64,

    jni_strings: HashMap<u64, String>,
    next_string_ref: u64,
    class_refs: HashMap<String, u64>,
    next_class_ref: u64,
    method_refs: HashMap<String, u64>,
    next_method_ref: u64,
    field_refs: HashMap<String, u64>,
    next_field_ref: u64,
}

static CURRENT: Lazy<Mutex<Option<Env>>> = Lazy::new(|| Mutex::new(None));

pub(crate) fn register() {
    DEFAULT_REGISTRY.register_detector(Detector {
        name: "jni",
        patterns: &[
            "JNI_OnLoad",
            "_JNIEnv",
            "JavaVM",
            "GetEnv",
            "AttachCurrentThread",
        ],
        activate: activate_jni,
        description: "JNI/JavaVM mock environment",
    });
}

/// Builds the vtables and rebinds the session singleton. Re-activation for a
/// fresh emulator drops the old reference pools.
fn activate_jni(
    emu: &mut Emulator,
    _imports: &HashMap<String, u64>,
    _symbols: &HashMap<String, u64>,
) -> usize {
    let mut env = Env::new();
    env.install(emu);
    *CURRENT.lock().unwrap() = Some(env);
    stubs::log_call(emu, "jni", "activate", "JNI vtables installed");
    1
}

/// JNIEnv* for priming guest calls, 0 when JNI was never activated.
pub fn jni_env() -> u64 {
    CURRENT
        .lock()
        .unwrap()
        .as_ref()
        .map(|e| e.jni_env_base)
        .unwrap_or(0)
}

/// JavaVM* for JNI_OnLoad-style entry points, 0 when not activated.
pub fn java_vm() -> u64 {
    CURRENT
        .lock()
        .unwrap()
        .as_ref()
        .map(|e| e.java_vm_base)
        .unwrap_or(0)
}

/// Interned jstrings, for inspection after a run.
pub fn jni_strings() -> HashMap<u64, String> {
    CURRENT
        .lock()
        .unwrap()
        .as_ref()
        .map(|e| e.jni_strings.clone())
        .unwrap_or_default()
}

impl Env {
    fn new() -> Env {
        Env {
            jni_env_base: 0,
            jni_vtable_base: 0,
            jni_stub_base: 0,
            java_vm_base: 0,
            java_vm_vtable: 0,
            java_vm_stub_base: 0,
            mock_obj_base: 0,
            jni_strings: HashMap::new(),
            next_string_ref: 0x1000,
            class_refs: HashMap::new(),
            next_class_ref: 0x2000,
            method_refs: HashMap::new(),
            next_method_ref: 0x3000,
            field_refs: HashMap::new(),
            next_field_ref: 0x4000,
        }
    }

    /// Writes both tables into the stub region. The JNIEnv*/JavaVM* handed to
    /// guest code are pointers whose first qword is the matching vtable.
    fn install(&mut self, emu: &mut Emulator) {
        let base = STUB_BASE + 0x10000;
        self.jni_env_base = base;
        self.jni_vtable_base = base + 0x1000;
        self.jni_stub_base = base + 0x2000;
        self.java_vm_base = base + 0x3000;
        self.java_vm_vtable = base + 0x4000;
        self.java_vm_stub_base = base + 0x5000;
        self.mock_obj_base = base + 0x6000;

        for i in 0..JNI_FUNC_COUNT {
            let stub = self.jni_stub_base + i as u64 * 4;
            let _ = emu.mem_write(stub, &RET_INSN);
            let _ = emu.mem_write_u64(self.jni_vtable_base + i as u64 * 8, stub);
            install_jni_handler(emu, i, stub);
        }
        let _ = emu.mem_write_u64(self.jni_env_base, self.jni_vtable_base);

        for i in 0..JAVAVM_FUNC_COUNT {
            let stub = self.java_vm_stub_base + i as u64 * 4;
            let _ = emu.mem_write(stub, &RET_INSN);
            let _ = emu.mem_write_u64(self.java_vm_vtable + i as u64 * 8, stub);
            install_java_vm_handler(emu, i, stub);
        }
        let _ = emu.mem_write_u64(self.java_vm_base, self.java_vm_vtable);
    }
}

fn hook(emu: &mut Emulator, addr: u64, f: crate::stubs::HookFn) {
    emu.hook_address(addr, std::rc::Rc::new(move |e: &mut Emulator| f(e)));
}

fn install_jni_handler(emu: &mut Emulator, index: usize, stub: u64) {
    match index {
        JNI_GET_VERSION => hook(emu, stub, stub_get_version),
        JNI_FIND_CLASS => hook(emu, stub, stub_find_class),
        JNI_GET_METHOD_ID => hook(emu, stub, stub_get_method_id),
        JNI_GET_STATIC_METHOD_ID => hook(emu, stub, stub_get_static_method_id),
        JNI_GET_OBJECT_CLASS => hook(emu, stub, stub_get_object_class),
        JNI_NEW_STRING_UTF => hook(emu, stub, stub_new_string_utf),
        JNI_GET_STRING_UTF_CHARS => hook(emu, stub, stub_get_string_utf_chars),
        JNI_RELEASE_STRING_UTF_CHARS => hook(emu, stub, stub_void),
        JNI_GET_STRING_UTF_LENGTH => hook(emu, stub, stub_get_string_utf_length),
        JNI_GET_JAVA_VM => hook(emu, stub, stub_get_java_vm),
        JNI_CALL_OBJECT_METHOD | JNI_CALL_BOOLEAN_METHOD | JNI_CALL_INT_METHOD
        | JNI_CALL_LONG_METHOD => hook(emu, stub, stub_call_method),
        JNI_CALL_STATIC_OBJECT_METHOD
        | JNI_CALL_STATIC_BOOLEAN_METHOD
        | JNI_CALL_STATIC_INT_METHOD
        | JNI_CALL_STATIC_LONG_METHOD => hook(emu, stub, stub_call_static_method),
        JNI_CALL_VOID_METHOD | JNI_CALL_STATIC_VOID_METHOD => hook(emu, stub, stub_void),
        JNI_GET_FIELD_ID => hook(emu, stub, stub_get_field_id),
        JNI_GET_STATIC_FIELD_ID => hook(emu, stub, stub_get_static_field_id),
        JNI_GET_OBJECT_FIELD | JNI_GET_BOOLEAN_FIELD | JNI_GET_INT_FIELD | JNI_GET_LONG_FIELD
        | JNI_GET_STATIC_OBJECT_FIELD | JNI_GET_STATIC_BOOLEAN_FIELD
        | JNI_GET_STATIC_INT_FIELD | JNI_GET_STATIC_LONG_FIELD => hook(emu, stub, stub_ret0),
        JNI_SET_OBJECT_FIELD | JNI_SET_BOOLEAN_FIELD | JNI_SET_INT_FIELD | JNI_SET_LONG_FIELD => {
            hook(emu, stub, stub_void)
        }
        JNI_NEW_GLOBAL_REF | JNI_NEW_LOCAL_REF | JNI_NEW_WEAK_GLOBAL_REF => {
            hook(emu, stub, stub_new_ref)
        }
        JNI_DELETE_GLOBAL_REF | JNI_DELETE_LOCAL_REF | JNI_DELETE_WEAK_GLOBAL_REF => {
            hook(emu, stub, stub_void)
        }
        JNI_EXCEPTION_CHECK | JNI_EXCEPTION_OCCURRED => hook(emu, stub, stub_ret0),
        JNI_EXCEPTION_CLEAR | JNI_EXCEPTION_DESCRIBE => hook(emu, stub, stub_void),
        JNI_PUSH_LOCAL_FRAME | JNI_ENSURE_LOCAL_CAPACITY => hook(emu, stub, stub_jni_ok),
        JNI_POP_LOCAL_FRAME => hook(emu, stub, stub_pop_local_frame),
        JNI_NEW_BYTE_ARRAY => hook(emu, stub, stub_new_byte_array),
        JNI_GET_BYTE_ARRAY_ELEMENTS => hook(emu, stub, stub_get_byte_array_elements),
        JNI_RELEASE_BYTE_ARRAY_ELEMENTS => hook(emu, stub, stub_void),
        JNI_GET_ARRAY_LENGTH => hook(emu, stub, stub_get_array_length),
        JNI_REGISTER_NATIVES => hook(emu, stub, stub_register_natives),
        JNI_MONITOR_ENTER | JNI_MONITOR_EXIT => hook(emu, stub, stub_jni_ok),
        JNI_IS_SAME_OBJECT => hook(emu, stub, stub_is_same_object),
        _ => hook(emu, stub, stub_jni_generic),
    }
}

fn install_java_vm_handler(emu: &mut Emulator, index: usize, stub: u64) {
    match index {
        JAVAVM_GET_ENV | JAVAVM_ATTACH_CURRENT_THREAD | JAVAVM_ATTACH_AS_DAEMON => {
            hook(emu, stub, stub_vm_get_env)
        }
        JAVAVM_DETACH_CURRENT_THREAD | JAVAVM_DESTROY => hook(emu, stub, stub_jni_ok),
        _ => hook(emu, stub, stub_jni_ok),
    }
}

fn with_env<T>(f: impl FnOnce(&mut Env) -> T) -> Option<T> {
    CURRENT.lock().unwrap().as_mut().map(f)
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

fn stub_jni_ok(emu: &mut Emulator) -> bool {
    let _ = emu.set_x(0, JNI_OK);
    return_from_stub(emu);
    false
}

fn stub_jni_generic(emu: &mut Emulator) -> bool {
    let obj = with_env(|env| env.mock_obj_base).unwrap_or(0);
    let _ = emu.set_x(0, obj);
    return_from_stub(emu);
    false
}

fn stub_get_version(emu: &mut Emulator) -> bool {
    let _ = emu.set_x(0, JNI_VERSION_1_6);
    return_from_stub(emu);
    false
}

fn stub_find_class(emu: &mut Emulator) -> bool {
    let class_name = emu.mem_read_string(emu.x(1), 256).unwrap_or_default();
    let reference = with_env(|env| {
        if let Some(&r) = env.class_refs.get(&class_name) {
            r
        } else {
            let r = env.mock_obj_base + env.next_class_ref;
            env.next_class_ref += 8;
            env.class_refs.insert(class_name.clone(), r);
            r
        }
    })
    .unwrap_or(0);

    stubs::log_call(emu, "jni", "FindClass", &class_name);
    let _ = emu.set_x(0, reference);
    return_from_stub(emu);
    false
}

fn intern_method(emu: &mut Emulator, key_prefix: &str, bank: u64) -> (String, u64) {
    let name = emu.mem_read_string(emu.x(2), 256).unwrap_or_default();
    let sig = emu.mem_read_string(emu.x(3), 256).unwrap_or_default();
    let key = format!("{key_prefix}{name}{sig}");
    let reference = with_env(|env| {
        if let Some(&r) = env.method_refs.get(&key) {
            r
        } else {
            let r = env.mock_obj_base + bank + env.next_method_ref;
            env.next_method_ref += 8;
            env.method_refs.insert(key.clone(), r);
            r
        }
    })
    .unwrap_or(0);
    (format!("{name}{sig}"), reference)
}

fn stub_get_method_id(emu: &mut Emulator) -> bool {
    let (label, reference) = intern_method(emu, "", 0x10000);
    stubs::log_call(emu, "jni", "GetMethodID", &label);
    let _ = emu.set_x(0, reference);
    return_from_stub(emu);
    false
}

fn stub_get_static_method_id(emu: &mut Emulator) -> bool {
    let (label, reference) = intern_method(emu, "static:", 0x20000);
    stubs::log_call(emu, "jni", "GetStaticMethodID", &label);
    let _ = emu.set_x(0, reference);
    return_from_stub(emu);
    false
}

fn stub_get_object_class(emu: &mut Emulator) -> bool {
    let reference = with_env(|env| env.mock_obj_base + 0x30000).unwrap_or(0);
    let _ = emu.set_x(0, reference);
    return_from_stub(emu);
    false
}

fn stub_new_string_utf(emu: &mut Emulator) -> bool {
    let s = emu.mem_read_string(emu.x(1), 4096).unwrap_or_default();
    let reference = with_env(|env| {
        let r = env.mock_obj_base + env.next_string_ref;
        env.next_string_ref += 8;
        env.jni_strings.insert(r, s.clone());
        r
    })
    .unwrap_or(0);

    let shown = if s.len() > 40 { format!("{}...", &s[..40]) } else { s };
    stubs::log_call(emu, "jni", "NewStringUTF", &format!("\"{shown}\""));
    let _ = emu.set_x(0, reference);
    return_from_stub(emu);
    false
}

fn stub_get_string_utf_chars(emu: &mut Emulator) -> bool {
    let jstr = emu.x(1);
    let is_copy = emu.x(2);

    let s = with_env(|env| env.jni_strings.get(&jstr).cloned().unwrap_or_default())
        .unwrap_or_default();

    let buf = emu.malloc(s.len() as u64 + 1);
    let _ = emu.mem_write_string(buf, &s);
    if is_copy != 0 {
        let _ = emu.mem_write_u8(is_copy, 1);
    }
    let _ = emu.set_x(0, buf);
    return_from_stub(emu);
    false
}

fn stub_get_string_utf_length(emu: &mut Emulator) -> bool {
    let jstr = emu.x(1);
    let len = with_env(|env| env.jni_strings.get(&jstr).map(|s| s.len()).unwrap_or(0))
        .unwrap_or(0);
    let _ = emu.set_x(0, len as u64);
    return_from_stub(emu);
    false
}

fn stub_get_java_vm(emu: &mut Emulator) -> bool {
    let vm_ptr = emu.x(1);
    let vm = with_env(|env| env.java_vm_base).unwrap_or(0);
    if vm_ptr != 0 {
        let _ = emu.mem_write_u64(vm_ptr, vm);
    }
    let _ = emu.set_x(0, JNI_OK);
    return_from_stub(emu);
    false
}

fn stub_call_method(emu: &mut Emulator) -> bool {
    let result = with_env(|env| env.mock_obj_base + 0x40000).unwrap_or(0);
    let _ = emu.set_x(0, result);
    return_from_stub(emu);
    false
}

fn stub_call_static_method(emu: &mut Emulator) -> bool {
    let result = with_env(|env| env.mock_obj_base + 0x50000).unwrap_or(0);
    let _ = emu.set_x(0, result);
    return_from_stub(emu);
    false
}

fn intern_field(emu: &mut Emulator, key_prefix: &str, bank: u64) -> (String, u64) {
    let name = emu.mem_read_string(emu.x(2), 256).unwrap_or_default();
    let sig = emu.mem_read_string(emu.x(3), 256).unwrap_or_default();
    let key = format!("{key_prefix}{name}{sig}");
    let reference = with_env(|env| {
        if let Some(&r) = env.field_refs.get(&key) {
            r
        } else {
            let r = env.mock_obj_base + bank + env.next_field_ref;
            env.next_field_ref += 8;
            env.field_refs.insert(key.clone(), r);
            r
        }
    })
    .unwrap_or(0);
    (name, reference)
}

fn stub_get_field_id(emu: &mut Emulator) -> bool {
    let (name, reference) = intern_field(emu, "", 0x60000);
    stubs::log_call(emu, "jni", "GetFieldID", &name);
    let _ = emu.set_x(0, reference);
    return_from_stub(emu);
    false
}

fn stub_get_static_field_id(emu: &mut Emulator) -> bool {
    let (name, reference) = intern_field(emu, "static:", 0x70000);
    stubs::log_call(emu, "jni", "GetStaticFieldID", &name);
    let _ = emu.set_x(0, reference);
    return_from_stub(emu);
    false
}

fn stub_new_ref(emu: &mut Emulator) -> bool {
    let obj = emu.x(1);
    let _ = emu.set_x(0, obj);
    return_from_stub(emu);
    false
}

fn stub_pop_local_frame(emu: &mut Emulator) -> bool {
    let result = emu.x(1);
    let _ = emu.set_x(0, result);
    return_from_stub(emu);
    false
}

fn stub_new_byte_array(emu: &mut Emulator) -> bool {
    let length = emu.x(1);
    let arr = emu.malloc(length + 16); // 8-byte length header plus slack
    let _ = emu.mem_write_u64(arr, length);
    let _ = emu.set_x(0, arr);
    return_from_stub(emu);
    false
}

fn stub_get_byte_array_elements(emu: &mut Emulator) -> bool {
    let arr = emu.x(1);
    let is_copy = emu.x(2);
    if is_copy != 0 {
        let _ = emu.mem_write_u8(is_copy, 0);
    }
    let _ = emu.set_x(0, arr + 8);
    return_from_stub(emu);
    false
}

fn stub_get_array_length(emu: &mut Emulator) -> bool {
    let arr = emu.x(1);
    let length = emu.mem_read_u64(arr).unwrap_or(0);
    let _ = emu.set_x(0, length);
    return_from_stub(emu);
    false
}

fn stub_register_natives(emu: &mut Emulator) -> bool {
    stubs::log_call(emu, "jni", "RegisterNatives", "");
    let _ = emu.set_x(0, JNI_OK);
    return_from_stub(emu);
    false
}

fn stub_is_same_object(emu: &mut Emulator) -> bool {
    let same = emu.x(1) == emu.x(2);
    let _ = emu.set_x(0, same as u64);
    return_from_stub(emu);
    false
}

fn stub_vm_get_env(emu: &mut Emulator) -> bool {
    let env_ptr = emu.x(1);
    let env = with_env(|e| e.jni_env_base).unwrap_or(0);
    if env_ptr != 0 {
        let _ = emu.mem_write_u64(env_ptr, env);
    }
    let _ = emu.set_x(0, JNI_OK);
    return_from_stub(emu);
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    // The session singleton is process-wide; serialize tests that rebind it.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    fn activated() -> (std::sync::MutexGuard<'static, ()>, Box<Emulator>) {
        let guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut emu = Emulator::new().unwrap();
        emu.set_lr(crate::emu::SENTINEL).unwrap();
        let empty = HashMap::new();
        activate_jni(&mut emu, &empty, &empty);
        (guard, emu)
    }

    #[test]
    fn env_and_vm_point_at_their_vtables() {
        let (_guard, emu) = activated();
        let env = jni_env();
        let vm = java_vm();
        assert_ne!(env, 0);
        assert_ne!(vm, 0);

        let env_vtable = emu.mem_read_u64(env).unwrap();
        let vm_vtable = emu.mem_read_u64(vm).unwrap();

        // Every slot holds a distinct RET stub.
        let slot0 = emu.mem_read_u64(env_vtable).unwrap();
        let slot1 = emu.mem_read_u64(env_vtable + 8).unwrap();
        assert_ne!(slot0, slot1);
        assert_eq!(emu.mem_read(slot0, 4).unwrap(), RET_INSN);

        let vm_slot3 = emu.mem_read_u64(vm_vtable + 8 * JAVAVM_GET_ENV as u64).unwrap();
        assert_eq!(emu.mem_read(vm_slot3, 4).unwrap(), RET_INSN);
    }

    #[test]
    fn get_env_writes_env_pointer() {
        let (_guard, mut emu) = activated();
        let out = emu.malloc(8);
        emu.set_x(0, java_vm()).unwrap();
        emu.set_x(1, out).unwrap();
        emu.set_x(2, JNI_VERSION_1_6).unwrap();
        stub_vm_get_env(&mut emu);

        assert_eq!(emu.x(0), JNI_OK);
        assert_eq!(emu.mem_read_u64(out).unwrap(), jni_env());
    }

    #[test]
    fn find_class_interns_per_name() {
        let (_guard, mut emu) = activated();
        let name = emu.malloc(32);
        emu.mem_write_string(name, "com/x/Y").unwrap();

        emu.set_x(1, name).unwrap();
        stub_find_class(&mut emu);
        let first = emu.x(0);
        assert_ne!(first, 0);

        emu.set_x(1, name).unwrap();
        stub_find_class(&mut emu);
        assert_eq!(emu.x(0), first, "same class interns to the same ref");

        let other = emu.malloc(32);
        emu.mem_write_string(other, "com/x/Z").unwrap();
        emu.set_x(1, other).unwrap();
        stub_find_class(&mut emu);
        assert_ne!(emu.x(0), first);
    }

    #[test]
    fn string_utf_round_trip() {
        let (_guard, mut emu) = activated();
        let src = emu.malloc(16);
        emu.mem_write_string(src, "tok").unwrap();

        emu.set_x(1, src).unwrap();
        stub_new_string_utf(&mut emu);
        let jstr = emu.x(0);
        assert_ne!(jstr, 0);

        emu.set_x(1, jstr).unwrap();
        stub_get_string_utf_length(&mut emu);
        assert_eq!(emu.x(0), 3);

        let is_copy = emu.malloc(8);
        emu.set_x(1, jstr).unwrap();
        emu.set_x(2, is_copy).unwrap();
        stub_get_string_utf_chars(&mut emu);
        let chars = emu.x(0);
        assert_eq!(emu.mem_read_string(chars, 16).unwrap(), "tok");
        assert_eq!(emu.mem_read_u8(is_copy).unwrap(), 1);
    }

    #[test]
    fn byte_arrays_carry_length_header() {
        let (_guard, mut emu) = activated();
        emu.set_x(1, 32).unwrap();
        stub_new_byte_array(&mut emu);
        let arr = emu.x(0);

        emu.set_x(1, arr).unwrap();
        stub_get_array_length(&mut emu);
        assert_eq!(emu.x(0), 32);

        emu.set_x(1, arr).unwrap();
        emu.set_x(2, 0).unwrap();
        stub_get_byte_array_elements(&mut emu);
        assert_eq!(emu.x(0), arr + 8);
    }

    #[test]
    fn is_same_object_compares_pointers() {
        let (_guard, mut emu) = activated();
        emu.set_x(1, 0x1000).unwrap();
        emu.set_x(2, 0x1000).unwrap();
        stub_is_same_object(&mut emu);
        assert_eq!(emu.x(0), 1);

        emu.set_x(1, 0x1000).unwrap();
        emu.set_x(2, 0x2000).unwrap();
        stub_is_same_object(&mut emu);
        assert_eq!(emu.x(0), 0);
    }
}
