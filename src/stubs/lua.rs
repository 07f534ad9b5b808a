//! Lua C API stubs. Cocos2d-x Lua games statically link the interpreter and
//! call it heavily during startup; the stubs keep that path moving with an
//! empty stack and benign defaults. Strings pushed or looked up by name are
//! logged because script and asset names often leak key context.

use once_cell::sync::Lazy;
use std::sync::Mutex;

use crate::emu::Emulator;
use crate::stubs::{self, DEFAULT_REGISTRY, format_hex, return_from_stub};

pub const LUA_TNIL: u64 = 0;
pub const LUA_OK: u64 = 0;

/// One fake lua_State shared by every call.
static LUA_STATE: Lazy<Mutex<u64>> = Lazy::new(|| Mutex::new(0));

pub(crate) fn register() {
    let r = &*DEFAULT_REGISTRY;

    // Pure no-ops: stack shuffling, push/set without observable results.
    for name in [
        "lua_settop",
        "lua_pop",
        "lua_remove",
        "lua_insert",
        "lua_replace",
        "lua_copy",
        "lua_pushnil",
        "lua_pushnumber",
        "lua_pushinteger",
        "lua_pushboolean",
        "lua_pushvalue",
        "lua_pushlightuserdata",
        "lua_pushcclosure",
        "lua_pushcfunction",
        "lua_gettable",
        "lua_rawget",
        "lua_rawgeti",
        "lua_settable",
        "lua_rawset",
        "lua_rawseti",
        "lua_call",
        "lua_close",
        "lua_createtable",
        "lua_newtable",
        "luaL_unref",
        "luaopen_base",
        "luaopen_table",
        "luaopen_string",
        "luaopen_math",
        "luaopen_io",
        "luaopen_os",
        "luaopen_debug",
        "luaopen_package",
    ] {
        r.register_func("lua", name, stub_noop);
    }

    // Zero-returning queries: empty stack, nil values, no metatables.
    for name in [
        "lua_gettop",
        "lua_typename",
        "lua_getmetatable",
        "lua_isboolean",
        "lua_isnumber",
        "lua_isstring",
        "lua_istable",
        "lua_isfunction",
        "lua_iscfunction",
        "lua_isuserdata",
        "lua_tonumber",
        "lua_tointeger",
        "lua_toboolean",
        "lua_tostring",
        "lua_tolstring",
        "lua_touserdata",
        "lua_topointer",
        "lua_objlen",
        "lua_next",
        "lua_equal",
        "lua_rawequal",
        "lua_lessthan",
        "lua_pcall",
        "lua_cpcall",
        "lua_gc",
        "luaL_checknumber",
        "luaL_checkinteger",
        "luaL_optnumber",
        "luaL_optinteger",
        "luaL_checkstring",
        "luaL_checklstring",
        "luaL_checkudata",
        "luaL_getmetatable",
        "luaL_loadfile",
        "luaL_loadstring",
        "luaL_dofile",
        "luaL_dostring",
    ] {
        r.register_func("lua", name, stub_ret0);
    }

    // One-returning queries.
    for name in ["lua_checkstack", "lua_isnil", "lua_setmetatable", "luaL_newmetatable", "luaL_ref"] {
        r.register_func("lua", name, stub_ret1);
    }

    r.register_func("lua", "lua_type", stub_lua_type);
    r.register_func("lua", "lua_pushstring", stub_pushstring);
    r.register_func("lua", "lua_pushlstring", stub_pushlstring);
    r.register_func("lua", "lua_getfield", stub_field_name2);
    r.register_func("lua", "lua_setfield", stub_field_name2);
    r.register_func("lua", "lua_getglobal", stub_global_name1);
    r.register_func("lua", "lua_setglobal", stub_global_name1);
    r.register_func("lua", "lua_register", stub_global_name1);
    r.register_func("lua", "lua_newuserdata", stub_newuserdata);
    r.register_func("lua", "lua_error", stub_error);
    r.register_func("lua", "luaL_error", stub_error);
    r.register_func("lua", "luaL_newstate", stub_newstate);
    r.register_func("lua", "lua_newstate", stub_newstate);
    r.register_func("lua", "luaL_openlibs", stub_openlibs);
    r.register_func("lua", "luaL_register", stub_register_lib);
    r.register_func("lua", "luaL_optstring", stub_optstring);
    r.register_func("lua", "luaL_loadbuffer", stub_loadbuffer);
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

fn stub_lua_type(emu: &mut Emulator) -> bool {
    let _ = emu.set_x(0, LUA_TNIL);
    return_from_stub(emu);
    false
}

fn stub_pushstring(emu: &mut Emulator) -> bool {
    let s_ptr = emu.x(1);
    if s_ptr != 0 {
        if let Ok(s) = emu.mem_read_string(s_ptr, 256) {
            if !s.is_empty() {
                stubs::log_call(emu, "lua", "lua_pushstring", &s);
            }
        }
    }
    let _ = emu.set_x(0, s_ptr);
    return_from_stub(emu);
    false
}

fn stub_pushlstring(emu: &mut Emulator) -> bool {
    let s_ptr = emu.x(1);
    let _ = emu.set_x(0, s_ptr);
    return_from_stub(emu);
    false
}

/// getfield/setfield carry the key name in X2.
fn stub_field_name2(emu: &mut Emulator) -> bool {
    let k_ptr = emu.x(2);
    if k_ptr != 0 {
        if let Ok(k) = emu.mem_read_string(k_ptr, 128) {
            if !k.is_empty() {
                stubs::log_call(emu, "lua", "lua_getfield", &k);
            }
        }
    }
    return_from_stub(emu);
    false
}

/// getglobal/setglobal/register carry the name in X1.
fn stub_global_name1(emu: &mut Emulator) -> bool {
    let name_ptr = emu.x(1);
    if name_ptr != 0 {
        if let Ok(name) = emu.mem_read_string(name_ptr, 128) {
            if !name.is_empty() {
                stubs::log_call(emu, "lua", "lua_getglobal", &name);
            }
        }
    }
    return_from_stub(emu);
    false
}

fn stub_newuserdata(emu: &mut Emulator) -> bool {
    let size = emu.x(1).max(64);
    let ptr = emu.malloc(size);
    let _ = emu.set_x(0, ptr);
    return_from_stub(emu);
    false
}

fn stub_error(emu: &mut Emulator) -> bool {
    stubs::log_call(emu, "lua", "lua_error", "error raised");
    let _ = emu.set_x(0, 0);
    return_from_stub(emu);
    false
}

fn stub_newstate(emu: &mut Emulator) -> bool {
    let state = {
        let mut cached = LUA_STATE.lock().unwrap();
        if *cached == 0 {
            *cached = emu.malloc(256);
        }
        *cached
    };
    stubs::log_call(emu, "lua", "luaL_newstate", &format_hex(state));
    let _ = emu.set_x(0, state);
    return_from_stub(emu);
    false
}

fn stub_openlibs(emu: &mut Emulator) -> bool {
    stubs::log_call(emu, "lua", "luaL_openlibs", "");
    return_from_stub(emu);
    false
}

fn stub_register_lib(emu: &mut Emulator) -> bool {
    let libname = emu.x(1);
    if libname != 0 {
        if let Ok(name) = emu.mem_read_string(libname, 128) {
            stubs::log_call(emu, "lua", "luaL_register", &name);
        }
    }
    return_from_stub(emu);
    false
}

fn stub_optstring(emu: &mut Emulator) -> bool {
    // Pretend the argument was nil: hand back the caller's default.
    let default = emu.x(2);
    let _ = emu.set_x(0, default);
    return_from_stub(emu);
    false
}

/// Chunk names passed to loadbuffer name the scripts being decrypted. Worth
/// surfacing even though the load itself is a no-op.
fn stub_loadbuffer(emu: &mut Emulator) -> bool {
    let name_ptr = emu.x(3);
    if name_ptr != 0 {
        if let Ok(name) = emu.mem_read_string(name_ptr, 256) {
            if !name.is_empty() {
                stubs::log_call(emu, "lua", "luaL_loadbuffer", &name);
            }
        }
    }
    let _ = emu.set_x(0, LUA_OK);
    return_from_stub(emu);
    false
}
