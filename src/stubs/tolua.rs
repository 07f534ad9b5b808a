//! tolua++ binding stubs. Registration calls are logged (module and class
//! names map out the script API surface); conversions return benign defaults.

use crate::emu::Emulator;
use crate::stubs::{self, DEFAULT_REGISTRY, return_from_stub};

pub(crate) fn register() {
    let r = &*DEFAULT_REGISTRY;

    for name in [
        "tolua_open",
        "tolua_module",
        "tolua_beginmodule",
        "tolua_endmodule",
        "tolua_class",
        "tolua_cclass",
        "tolua_function",
        "tolua_fix_function",
        "tolua_variable",
        "tolua_constant",
        "tolua_usertype",
        "tolua_register_gc",
    ] {
        r.register_func("tolua", name, stub_registration);
    }

    for name in [
        "tolua_pushnumber",
        "tolua_pushboolean",
        "tolua_pushfieldnumber",
        "tolua_pushfieldboolean",
        "tolua_pushfieldstring",
        "tolua_pushfieldusertype",
        "toluafix_pushusertype_ccobject",
    ] {
        r.register_func("tolua", name, stub_noop);
    }

    r.register_func("tolua", "tolua_pushstring", stub_pushstring);
    r.register_func("tolua", "tolua_pushusertype", stub_noop);

    for name in [
        "tolua_isnumber",
        "tolua_isboolean",
        "tolua_istable",
        "tolua_isusertable",
        "tolua_isusertype",
        "tolua_isnoobj",
        "tolua_tonumber",
        "tolua_toboolean",
        "tolua_tostring",
        "tolua_getmetatable",
        "tolua_error",
    ] {
        r.register_func("tolua", name, stub_ret0);
    }

    r.register_func("tolua", "tolua_isstring", stub_ret0);
    r.register_func("tolua", "tolua_tousertype", stub_tousertype);
    r.register_func("tolua", "tolua_newmetatable", stub_ret1);
}

fn stub_noop(emu: &mut Emulator) -> bool {
    return_from_stub(emu);
    false
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

/// Module/class/function names live in X1 or X2 depending on the call; both
/// are probed and whichever reads as text is logged.
fn stub_registration(emu: &mut Emulator) -> bool {
    for reg in [1usize, 2] {
        let ptr = emu.x(reg);
        if ptr < 0x1000 {
            continue;
        }
        if let Ok(name) = emu.mem_read_string(ptr, 128) {
            if !name.is_empty() && name.bytes().all(|b| (0x20..=0x7e).contains(&b)) {
                stubs::log_call(emu, "tolua", "tolua_register", &name);
                break;
            }
        }
    }
    return_from_stub(emu);
    false
}

fn stub_pushstring(emu: &mut Emulator) -> bool {
    let s_ptr = emu.x(1);
    if s_ptr != 0 {
        if let Ok(s) = emu.mem_read_string(s_ptr, 256) {
            if !s.is_empty() {
                stubs::log_call(emu, "tolua", "tolua_pushstring", &s);
            }
        }
    }
    return_from_stub(emu);
    false
}

fn stub_tousertype(emu: &mut Emulator) -> bool {
    let obj = emu.get_mock_object();
    let _ = emu.set_x(0, obj);
    return_from_stub(emu);
    false
}
