//! Internal-function mocking.
//!
//! Statically linked engine code (Lua interpreter, Cocos2d-x singletons,
//! locale machinery) executes against global state the emulator never
//! constructed. Rather than emulate all of it, symbols that are known to
//! wander are hooked at their bodies and replaced with a return-convention
//! mock. The convention is inferred once from the symbol name and stored
//! with the hook.

use std::collections::HashMap;
use std::rc::Rc;

use crate::emu::{AddressHook, Emulator};
use crate::stubs::{DEFAULT_REGISTRY, Detector, return_from_stub};

/// How a mocked function pretends to return.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReturnBehavior {
    /// RTTI helpers answer "no match".
    Rtti,
    /// Map operator[] returning `Value&`.
    ValueRef,
    /// Returns std::string by value through X8.
    StringRet,
    /// No return value; X0 left untouched.
    Void,
    /// Query methods answer yes.
    Bool,
    /// Counts and sizes are zero.
    Int,
    /// Everything else hands back the mock object.
    Object,
}

pub(crate) fn register() {
    DEFAULT_REGISTRY.register_detector(Detector {
        name: "internal-mock",
        patterns: &[
            "lua_",
            "luaL_",
            "tolua_",
            "getInstance",
            "LuaEngine",
            "LuaStack",
            "ResourcesDecode",
        ],
        activate: activate_internal_mock,
        description: "Internal function mocking for Lua/cocos2d",
    });
}

fn activate_internal_mock(
    emu: &mut Emulator,
    imports: &HashMap<String, u64>,
    symbols: &HashMap<String, u64>,
) -> usize {
    let mut installed = 0;

    for (name, &addr) in symbols {
        if addr == 0 {
            continue;
        }
        // PLT imports already carry their own stubs.
        if imports.contains_key(name) {
            continue;
        }
        if should_mock(name) {
            let behavior = infer_return_behavior(name);
            emu.hook_address(addr, make_mock_hook(behavior));
            installed += 1;
        }
    }

    installed
}

const LUA_API_FUNCS: &[&str] = &[
    "lua_gettop",
    "lua_settop",
    "lua_pushvalue",
    "lua_remove",
    "lua_insert",
    "lua_replace",
    "lua_checkstack",
    "lua_xmove",
    "lua_type",
    "lua_typename",
    "lua_isnumber",
    "lua_isstring",
    "lua_iscfunction",
    "lua_isuserdata",
    "lua_isfunction",
    "lua_istable",
    "lua_isnil",
    "lua_isboolean",
    "lua_isthread",
    "lua_tonumber",
    "lua_tointeger",
    "lua_toboolean",
    "lua_tolstring",
    "lua_tostring",
    "lua_tocfunction",
    "lua_touserdata",
    "lua_tothread",
    "lua_topointer",
    "lua_objlen",
    "lua_rawlen",
    "lua_pushnil",
    "lua_pushnumber",
    "lua_pushinteger",
    "lua_pushlstring",
    "lua_pushstring",
    "lua_pushcclosure",
    "lua_pushcfunction",
    "lua_pushboolean",
    "lua_pushlightuserdata",
    "lua_pushthread",
    "lua_pushvfstring",
    "lua_pushfstring",
    "lua_gettable",
    "lua_getfield",
    "lua_rawget",
    "lua_rawgeti",
    "lua_createtable",
    "lua_newtable",
    "lua_newuserdata",
    "lua_settable",
    "lua_setfield",
    "lua_rawset",
    "lua_rawseti",
    "lua_setmetatable",
    "lua_getmetatable",
    "lua_setglobal",
    "lua_getglobal",
    "lua_register",
    "lua_call",
    "lua_pcall",
    "lua_cpcall",
    "lua_load",
    "lua_dump",
    "lua_gc",
    "lua_error",
    "lua_next",
    "lua_concat",
    "lua_getallocf",
    "lua_setallocf",
    "lua_getupvalue",
    "lua_setupvalue",
    "lua_setlevel",
    "lua_atpanic",
    "lua_newthread",
    "lua_newstate",
    "lua_close",
    "lua_status",
    "lual_newstate",
    "lual_openlibs",
    "lual_register",
    "lual_getmetafield",
    "lual_callmeta",
    "lual_typerror",
    "lual_argerror",
    "lual_checknumber",
    "lual_optnumber",
    "lual_checkinteger",
    "lual_optinteger",
    "lual_checkstring",
    "lual_optstring",
    "lual_checklstring",
    "lual_optlstring",
    "lual_checkudata",
    "lual_checktype",
    "lual_checkany",
    "lual_newmetatable",
    "lual_checkstack",
    "lual_loadfile",
    "lual_loadbuffer",
    "lual_loadstring",
    "lual_ref",
    "lual_unref",
    "lual_gsub",
    "lual_findtable",
    "lual_where",
    "lual_error",
    "lual_dofile",
    "lual_dostring",
];

const SETUP_PATTERNS: &[&str] = &[
    "addsearchpath",
    "lua_module_register",
    "lua_register",
    "luaengine",
    "luahelper",
    "luaopen_",
    "luastack",
    "register_all_cocos2d",
    "register_all_cocos2dx",
    "register_custom",
    "register_hummer",
    "removescriptengine",
    "resourcesdecode",
    "restart_lua",
    "schedule",
    "scheduler::schedule",
    "scheduleupdate",
    "setanimationinterval",
    "setscriptengine",
    "shareddecode",
    "tolua_",
    "unschedule",
    "init_adjust",
    "init_appsflyer",
    "init_facebook",
    "initplatform",
    "initcrashreport",
    "crashreport",
    "_map_base",
    "_hashtable",
    "_select1st",
    "_prime_rehash",
    "getvaluemap",
    "getarchtype",
    "cocos2d::log",
    "cocos2d::value",
    "buglyluaagent",
    "pluginjnihelper",
    "register_bole",
    "register_all_pluginx",
    "package_quick_register",
    "loadchunksfromzip",
];

const RTTI_PATTERNS: &[&str] = &[
    "__do_catch",
    "__do_dyncast",
    "__do_upcast",
    "__is_pointer_p",
    "__is_function_p",
];

/// Decides whether an internal text symbol gets a mock hook.
pub fn should_mock(name: &str) -> bool {
    let lower = name.to_lowercase();

    // Key setters are owned by the capture hooks; mocking them here would
    // throw the secret away.
    if lower.contains("setxxteakey")
        || lower.contains("setcryptokey")
        || lower.contains("xxteakeyandsign")
    {
        return false;
    }

    if lower.contains("getinstance") {
        return true;
    }
    if lower.contains("::start") || lower.contains("::init") || lower.contains("::create") {
        return true;
    }

    for f in LUA_API_FUNCS {
        if name == *f || lower.contains(f) {
            return true;
        }
    }
    for p in SETUP_PATTERNS {
        if lower.contains(p) {
            return true;
        }
    }
    for p in RTTI_PATTERNS {
        if lower.contains(p) {
            return true;
        }
    }

    // cocos2d::Application constructors.
    if lower.contains("cocos2d")
        && lower.contains("application")
        && (lower.contains("c2ev") || lower.contains("c1ev"))
    {
        return true;
    }

    // std::ctype<char> constructors touch the _ctype_ global directly.
    if lower.contains("st5ctype") && (lower.contains("c2e") || lower.contains("c1e")) {
        return true;
    }

    // Locale facets walk uninitialized globals.
    if lower.contains("st6locale")
        || lower.contains("st7collate")
        || lower.contains("st7codecvt")
        || lower.contains("st7num_get")
        || lower.contains("st7num_put")
        || lower.contains("st8numpunct")
        || lower.contains("st8time_get")
        || lower.contains("st8time_put")
        || lower.contains("st8messages")
        || lower.contains("st9money_get")
        || lower.contains("st9money_put")
        || lower.contains("st10moneypunct")
    {
        return true;
    }

    // Container internals that crash without a constructed header node.
    if lower.contains("st8_rb_tree") || lower.contains("st5deque") {
        return true;
    }

    if lower.contains("framebuffer") && (lower.contains("c1e") || lower.contains("c2e")) {
        return true;
    }
    if lower.contains("asynctaskpool") && (lower.contains("d1e") || lower.contains("d2e")) {
        return true;
    }
    if lower.contains("cocos2d") && lower.contains("autorelease") {
        return true;
    }
    if lower.contains("poolmanager") || lower.contains("autoreleasepool") {
        return true;
    }
    if lower.contains("luaengine")
        || lower.contains("scriptenginemanager")
        || lower.contains("luastack")
    {
        return true;
    }
    if lower.contains("cocos2d") && lower.contains("director") {
        return true;
    }

    // CCGameMain: mock everything except the plain void
    // applicationDidFinishLaunching, which is where keys get set. The
    // lua_State* overload reads uninitialized BSS strings and dies.
    if lower.contains("ccgamemain") {
        if lower.contains("lua_state") || !lower.contains("applicationdidfinishlaunching") {
            return true;
        }
    }

    false
}

const STRING_RET_PATTERNS: &[&str] = &[
    "getpath",
    "getstring",
    "getname",
    "tostring",
    "getwritable",
    "fullpath",
    "getarch",
    "getkey",
    "getsign",
    "geturl",
    "geturi",
    "gettext",
    "getlabel",
    "gettitle",
    "getdescription",
];

const VOID_PREFIXES: &[&str] = &[
    "set", "init", "start", "stop", "reset", "clear", "release", "destroy", "remove", "delete",
    "add", "insert", "push", "pop", "on", "handle", "process", "update", "visit", "draw",
    "render", "register", "unregister", "schedule", "unschedule", "cleanup", "load", "save",
    "write", "close", "open", "begin", "end", "enter", "exit", "pause", "resume", "retain",
    "autorelease",
];

const VOID_EXCLUSIONS: &[&str] = &[
    "getset", "isset", "offset", "onset", "getinstance", "setget", "setup",
];

const BOOL_PREFIXES: &[&str] = &[
    "is", "has", "can", "should", "will", "did", "was", "check", "valid",
];

const INT_PATTERNS: &[&str] = &[
    "count", "size", "length", "index", "getint", "getcount", "getnumber", "getindex",
    "getsize", "getlength", "gettag",
];

/// Picks the return convention from the symbol name.
pub fn infer_return_behavior(name: &str) -> ReturnBehavior {
    let lower = name.to_lowercase();

    // Method name after the last scope separator.
    let mut method = match lower.rfind("::") {
        Some(idx) => &lower[idx + 2..],
        None => lower.as_str(),
    };
    if let Some(idx) = method.find('(') {
        method = &method[..idx];
    }

    if RTTI_PATTERNS.iter().any(|p| lower.contains(p)) {
        return ReturnBehavior::Rtti;
    }

    if (lower.contains("_map_base") || lower.contains("valuemap")) && lower.contains("value") {
        return ReturnBehavior::ValueRef;
    }

    if STRING_RET_PATTERNS.iter().any(|p| lower.contains(p)) {
        return ReturnBehavior::StringRet;
    }

    let void_prefix = VOID_PREFIXES.iter().any(|p| method.starts_with(p));
    let excluded = VOID_EXCLUSIONS.iter().any(|e| lower.contains(e));
    if void_prefix && !excluded {
        return ReturnBehavior::Void;
    }

    if BOOL_PREFIXES.iter().any(|p| method.starts_with(p)) {
        return ReturnBehavior::Bool;
    }

    if INT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return ReturnBehavior::Int;
    }

    ReturnBehavior::Object
}

/// Builds the hook for a mocked internal function.
pub(crate) fn make_mock_hook(behavior: ReturnBehavior) -> AddressHook {
    Rc::new(move |emu: &mut Emulator| {
        match behavior {
            ReturnBehavior::Rtti => {
                let _ = emu.set_x(0, 0);
            }
            ReturnBehavior::Object => {
                let mock = emu.get_mock_object();
                let _ = emu.set_x(0, mock);
            }
            ReturnBehavior::ValueRef => {
                // cocos2d::Value on ARM64: 8-byte union, 4-byte type enum,
                // padding. Type NONE keeps asString() off RTTI paths.
                let value_ptr = emu.get_mock_object() + 0x100;
                let _ = emu.mem_write(value_ptr, &[0u8; 16]);
                let _ = emu.set_x(0, value_ptr);
            }
            ReturnBehavior::Bool => {
                let _ = emu.set_x(0, 1);
            }
            ReturnBehavior::Void => {
                // X0 stays as-is, often still the this pointer.
            }
            ReturnBehavior::StringRet => {
                // Return-by-value string goes through the X8 buffer.
                let x8 = emu.x(8);
                if x8 > 0x1000 && x8 < 0x7000_0000_0000_0000 {
                    let _ = emu.mem_write(x8, &[0u8; 8]);
                }
                let _ = emu.set_x(0, x8);
            }
            ReturnBehavior::Int => {
                let _ = emu.set_x(0, 0);
            }
        }

        return_from_stub(emu);
        false
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setters_are_never_mocked() {
        assert!(!should_mock("_ZN15ResourcesDecode11setXXTeaKeyEPKci"));
        assert!(!should_mock("_ZN7cocos2d19setCryptoKeyAndSignE"));
    }

    #[test]
    fn singletons_and_lua_api_are_mocked() {
        assert!(should_mock("_ZN7cocos2d8Director11getInstanceEv"));
        assert!(should_mock("lua_gettop"));
        assert!(should_mock("luaL_openlibs"));
        assert!(should_mock("_ZN7cocos2d9LuaEngine4initEv"));
        assert!(should_mock("_ZNSt8_Rb_treeI5DummyE8_M_eraseEv"));
        assert!(!should_mock("plain_symbol"));
    }

    #[test]
    fn ccgamemain_keeps_the_key_setting_overload() {
        assert!(should_mock(
            "_ZN7cocos2d10CCGameMain29applicationDidFinishLaunchingEP9lua_State"
        ));
        assert!(!should_mock(
            "_ZN7cocos2d10CCGameMain29applicationDidFinishLaunchingEv"
        ));
        assert!(should_mock("_ZN7cocos2d10CCGameMain7restartEv"));
    }

    #[test]
    fn behavior_inference_by_name_shape() {
        assert_eq!(
            infer_return_behavior("_ZNK10__cxxabiv117__class_type_info10__do_catchE"),
            ReturnBehavior::Rtti
        );
        assert_eq!(
            infer_return_behavior("_ZNSt10_Map_baseI5ValueE5valueEv"),
            ReturnBehavior::ValueRef
        );
        assert_eq!(
            infer_return_behavior("_ZN7cocos2d9FileUtils11getWritablePathEv"),
            ReturnBehavior::StringRet
        );
        assert_eq!(
            infer_return_behavior("Engine::setAnimationInterval"),
            ReturnBehavior::Void
        );
        assert_eq!(
            infer_return_behavior("Director::isPaused"),
            ReturnBehavior::Bool
        );
        assert_eq!(
            infer_return_behavior("Vector::getCount"),
            ReturnBehavior::Int
        );
        assert_eq!(
            infer_return_behavior("Director::getInstance"),
            ReturnBehavior::Object
        );
    }

    #[test]
    fn void_exclusions_hold() {
        // "setup" and "getInstance" shapes must not be treated as void.
        assert_ne!(
            infer_return_behavior("Engine::setupRenderer"),
            ReturnBehavior::Void
        );
        assert_ne!(
            infer_return_behavior("Director::getInstance"),
            ReturnBehavior::Void
        );
    }

    #[test]
    fn mock_hooks_apply_their_convention() {
        let mut emu = Emulator::new().unwrap();
        emu.set_lr(crate::emu::SENTINEL).unwrap();

        let rtti = make_mock_hook(ReturnBehavior::Rtti);
        emu.set_x(0, 0x5555).unwrap();
        rtti(&mut emu);
        assert_eq!(emu.x(0), 0);

        let object = make_mock_hook(ReturnBehavior::Object);
        object(&mut emu);
        assert_eq!(emu.x(0), emu.get_mock_object());

        let boolean = make_mock_hook(ReturnBehavior::Bool);
        boolean(&mut emu);
        assert_eq!(emu.x(0), 1);

        let void = make_mock_hook(ReturnBehavior::Void);
        emu.set_x(0, 0x1234).unwrap();
        void(&mut emu);
        assert_eq!(emu.x(0), 0x1234, "void leaves X0 alone");

        let value_ref = make_mock_hook(ReturnBehavior::ValueRef);
        value_ref(&mut emu);
        let value_ptr = emu.x(0);
        assert_eq!(value_ptr, emu.get_mock_object() + 0x100);
        assert_eq!(emu.mem_read(value_ptr, 16).unwrap(), vec![0u8; 16]);
    }
}
