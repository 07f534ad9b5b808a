//! Key-setter capture hooks.
//!
//! Detectors watch for Cocos2d-x and Unity IL2CPP fingerprints; on a match,
//! every symbol that smells like a key setter gets a hook that decodes the
//! arguments at entry and records the secret. A setter can follow one of
//! several calling conventions, and nothing at the call site says which, so
//! the hooks discriminate by symbol-name shape and register-value ranges.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::Mutex;

use crate::emu::{AddressHook, Emulator};
use crate::stubs::cxxabi::string::read_std_string;
use crate::stubs::{self, DEFAULT_REGISTRY, Detector, return_from_stub};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyType {
    Xxtea,
    Signature,
    Crypto,
    Aes,
    Unknown,
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KeyType::Xxtea => "xxtea",
            KeyType::Signature => "signature",
            KeyType::Crypto => "crypto",
            KeyType::Aes => "aes",
            KeyType::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RiskLevel {
    Critical,
    High,
    Medium,
    Low,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::Critical => "critical",
            RiskLevel::High => "high",
            RiskLevel::Medium => "medium",
            RiskLevel::Low => "low",
        };
        f.write_str(s)
    }
}

/// A secret read out of guest memory. `value` is always non-empty printable
/// ASCII; the capture path drops anything else.
#[derive(Clone, Debug)]
pub struct CapturedKey {
    pub value: String,
    /// Symbol (or vtable slot description) that received the key.
    pub source: String,
    /// Guest PC at capture time.
    pub address: u64,
    pub key_type: KeyType,
    pub risk_level: RiskLevel,
}

static CAPTURED: Lazy<Mutex<Vec<CapturedKey>>> = Lazy::new(|| Mutex::new(Vec::new()));

pub fn captured_keys() -> Vec<CapturedKey> {
    CAPTURED.lock().unwrap().clone()
}

pub fn clear_captured_keys() {
    CAPTURED.lock().unwrap().clear();
}

fn is_printable(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| (0x20..=0x7e).contains(&b))
}

fn capture(emu: &Emulator, key: CapturedKey) {
    if !is_printable(&key.value) {
        return;
    }
    stubs::log_call(emu, "setter", &key.source, &key.value);
    CAPTURED.lock().unwrap().push(key);
}

/// Records a key on behalf of an external hook (the driver's vtable-slot
/// capture layer). Key type is inferred from the source name.
pub fn capture_key_direct(emu: &Emulator, value: &str, source: &str, address: u64) {
    if !is_printable(value) {
        return;
    }
    let lower = source.to_lowercase();
    let key_type = if lower.contains("xtea") {
        KeyType::Xxtea
    } else if lower.contains("signature") {
        KeyType::Signature
    } else if lower.contains("crypto") || lower.contains("aes") {
        KeyType::Crypto
    } else {
        KeyType::Unknown
    };

    capture(
        emu,
        CapturedKey {
            value: value.to_string(),
            source: source.to_string(),
            address,
            key_type,
            risk_level: RiskLevel::Critical,
        },
    );
}

pub(crate) fn register() {
    DEFAULT_REGISTRY.register_detector(Detector {
        name: "cocos2dx",
        patterns: &["cocos2d", "setXXTeaKey", "ZipUtils", "ccDecrypt", "jsb_set"],
        activate: activate_cocos2dx,
        description: "Cocos2d-x XXTEA key extraction",
    });
    DEFAULT_REGISTRY.register_detector(Detector {
        name: "unity-il2cpp",
        patterns: &["il2cpp", "Il2Cpp", "mono_"],
        activate: activate_unity_il2cpp,
        description: "Unity IL2CPP key extraction",
    });
}

fn activate_cocos2dx(
    emu: &mut Emulator,
    _imports: &HashMap<String, u64>,
    symbols: &HashMap<String, u64>,
) -> usize {
    let mut installed = 0;

    for (name, &addr) in symbols {
        if addr == 0 {
            continue;
        }
        let lower = name.to_lowercase();

        if lower.contains("setxxteakey") || lower.contains("set_xxtea_key") {
            emu.hook_address(addr, make_xxtea_key_hook(name.clone()));
            installed += 1;
            continue;
        }
        if name.contains("jsb") && name.contains("XTea") {
            emu.hook_address(addr, make_xxtea_key_hook(name.clone()));
            installed += 1;
            continue;
        }
        if name.contains("ZipUtils") && name.contains("Key") {
            emu.hook_address(addr, make_xxtea_key_hook(name.clone()));
            installed += 1;
            continue;
        }
        if name.contains("Application") && name.contains("XTea") {
            emu.hook_address(addr, make_xxtea_key_hook(name.clone()));
            installed += 1;
            continue;
        }
        if name.contains("setCryptoKey")
            || name.contains("CryptoKeyAndSign")
            || name.contains("setEncryptKey")
            || name.contains("setDecryptKey")
        {
            emu.hook_address(addr, make_std_string_setter_hook(name.clone()));
            installed += 1;
            continue;
        }
        if name.contains("setAESKey") || name.contains("AES_set_key") || name.contains("aes_key") {
            emu.hook_address(addr, make_generic_key_hook(name.clone(), KeyType::Aes));
            installed += 1;
        }
    }

    installed
}

fn activate_unity_il2cpp(
    emu: &mut Emulator,
    _imports: &HashMap<String, u64>,
    symbols: &HashMap<String, u64>,
) -> usize {
    let mut installed = 0;

    for (name, &addr) in symbols {
        if addr == 0 {
            continue;
        }
        // Cocos patterns belong to the cocos2dx detector.
        if name.contains("setCryptoKey") || name.contains("setXXTeaKey") || name.contains("cocos2d")
        {
            continue;
        }

        let crypt = name.contains("Encrypt") || name.contains("Decrypt");
        let keyed = name.contains("Key") || name.contains("key");
        if (crypt && keyed) || (name.contains("Crypto") && name.contains("Key")) {
            emu.hook_address(addr, make_generic_key_hook(name.clone(), KeyType::Unknown));
            installed += 1;
        }
    }

    installed
}

/// Lua-flavored setters take raw `const char*` plus length, not std::string.
fn is_lua_setter_symbol(name: &str) -> bool {
    let lower = name.to_lowercase();
    (lower.contains("setxxteakey") || lower.contains("setxxtea")) && !name.contains("basic_string")
}

/// Hook for XXTEA key setters. Three conventions are in play:
///
///   std::string const&:        X0 = &key (jsb_set_xxtea_key)
///   static (const char*, int): X0 = key, X1 = len
///   member (this, key, len, sign, len): X1 = key, X3 = sign
///
/// The static form is recognized by X1 holding a plausible length rather
/// than a pointer.
pub(crate) fn make_xxtea_key_hook(func_name: String) -> AddressHook {
    Rc::new(move |emu: &mut Emulator| {
        let x0 = emu.x(0);
        let x1 = emu.x(1);
        let x3 = emu.x(3);
        let x4 = emu.x(4);

        let mut key = String::new();

        if func_name.contains("basic_string") || func_name.contains("jsb_set") {
            if let Some(s) = read_std_string(emu, x0) {
                key = s;
            }
        }

        if key.is_empty() && is_lua_setter_symbol(&func_name) {
            if x1 > 0 && x1 < 256 {
                // Static form. The declared length may undercount; the key is
                // NUL terminated in practice.
                if let Ok(s) = emu.mem_read_string(x0, 128) {
                    if is_printable(&s) {
                        key = s;
                    }
                }
            } else if let Ok(s) = emu.mem_read_string(x1, 128) {
                if is_printable(&s) {
                    key = s;
                }
            }
        }

        if key.is_empty() {
            // Last resort: any argument register that points at printable
            // text.
            for reg in 0..3 {
                let ptr = emu.x(reg);
                if ptr < 0x1000 || ptr > 0x7000_0000_0000_0000 {
                    continue;
                }
                if let Ok(s) = emu.mem_read_string(ptr, 256) {
                    if is_printable(&s) {
                        key = s;
                        break;
                    }
                }
            }
        }

        if !key.is_empty() {
            capture(
                emu,
                CapturedKey {
                    value: key,
                    source: func_name.clone(),
                    address: emu.pc(),
                    key_type: KeyType::Xxtea,
                    risk_level: RiskLevel::Critical,
                },
            );

            // Member form may carry a signature in X3/X4.
            if x3 > 0x1000 && x4 > 0 && x4 < 256 {
                if let Ok(sign) = emu.mem_read_string(x3, 128) {
                    if is_printable(&sign) {
                        capture(
                            emu,
                            CapturedKey {
                                value: sign,
                                source: format!("{func_name}[signature]"),
                                address: emu.pc(),
                                key_type: KeyType::Signature,
                                risk_level: RiskLevel::Low,
                            },
                        );
                    }
                }
            }
        }

        return_from_stub(emu);
        false
    })
}

/// Hook for `setCryptoKeyAndSign(std::string const& key, std::string const&
/// sign)` shaped members: X0 = this, X1 = &key, X2 = &sign.
pub(crate) fn make_std_string_setter_hook(func_name: String) -> AddressHook {
    Rc::new(move |emu: &mut Emulator| {
        let x1 = emu.x(1);
        let x2 = emu.x(2);

        let mut key = read_std_string(emu, x1).unwrap_or_default();
        let sign = read_std_string(emu, x2).unwrap_or_default();

        if key.is_empty() && x1 > 0x1000 && x1 < 0x7000_0000_0000_0000 {
            if let Ok(s) = emu.mem_read_string(x1, 128) {
                if is_printable(&s) {
                    key = s;
                }
            }
        }

        if !key.is_empty() {
            capture(
                emu,
                CapturedKey {
                    value: key,
                    source: func_name.clone(),
                    address: emu.pc(),
                    key_type: KeyType::Xxtea,
                    risk_level: RiskLevel::Critical,
                },
            );
            if !sign.is_empty() {
                capture(
                    emu,
                    CapturedKey {
                        value: sign,
                        source: format!("{func_name}[signature]"),
                        address: emu.pc(),
                        key_type: KeyType::Signature,
                        risk_level: RiskLevel::Low,
                    },
                );
            }
        }

        return_from_stub(emu);
        false
    })
}

/// Hook for setters where only "some register points at the key" is known.
pub(crate) fn make_generic_key_hook(func_name: String, key_type: KeyType) -> AddressHook {
    Rc::new(move |emu: &mut Emulator| {
        for reg in 0..3 {
            let ptr = emu.x(reg);
            if ptr == 0 || ptr > 0x7000_0000_0000_0000 {
                continue;
            }
            if let Ok(s) = emu.mem_read_string(ptr, 256) {
                if is_printable(&s) {
                    capture(
                        emu,
                        CapturedKey {
                            value: s,
                            source: func_name.clone(),
                            address: emu.pc(),
                            key_type,
                            risk_level: RiskLevel::High,
                        },
                    );
                    break;
                }
            }
        }
        return_from_stub(emu);
        false
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stubs::cxxabi::string::write_sso_string;

    // The captured-key list is process-wide; hold this across each test so
    // parallel test threads do not interleave captures.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    fn fixture() -> (std::sync::MutexGuard<'static, ()>, Box<Emulator>) {
        let guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_captured_keys();
        let mut emu = Emulator::new().unwrap();
        emu.set_lr(crate::emu::SENTINEL).unwrap();
        (guard, emu)
    }

    #[test]
    fn jsb_hook_reads_std_string_argument() {
        let (_guard, mut emu) = fixture();
        let obj = emu.malloc(24);
        write_sso_string(&mut emu, obj, "SECRET_KEY_123").unwrap();

        emu.set_x(0, obj).unwrap();
        emu.set_x(1, 0).unwrap();
        emu.set_x(3, 0).unwrap();
        emu.set_x(4, 0).unwrap();

        let hook = make_xxtea_key_hook(
            "_ZN7cocos2d4jsb_17set_xxtea_keyERKNSt6__ndk112basic_stringIcNS_11char_traitsIcEENS_9allocatorIcEEEE"
                .to_string(),
        );
        hook(&mut emu);

        let keys = captured_keys();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].value, "SECRET_KEY_123");
        assert_eq!(keys[0].key_type, KeyType::Xxtea);
        assert_eq!(keys[0].risk_level, RiskLevel::Critical);
        assert!(keys[0].source.contains("jsb_"));
    }

    #[test]
    fn lua_member_hook_captures_key_and_signature() {
        let (_guard, mut emu) = fixture();
        let key = emu.malloc(16);
        emu.mem_write_string(key, "K1K2K3K4").unwrap();
        let sign = emu.malloc(16);
        emu.mem_write_string(sign, "SIGN_OK").unwrap();

        // this, key ptr, key len, sign ptr, sign len
        emu.set_x(0, emu.get_mock_object()).unwrap();
        emu.set_x(1, key).unwrap();
        emu.set_x(2, 8).unwrap();
        emu.set_x(3, sign).unwrap();
        emu.set_x(4, 7).unwrap();

        let hook = make_xxtea_key_hook("_ZN15ResourcesDecode11setXXTeaKeyEPKciS1_i".to_string());
        hook(&mut emu);

        let keys = captured_keys();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].value, "K1K2K3K4");
        assert_eq!(keys[0].key_type, KeyType::Xxtea);
        assert_eq!(keys[1].value, "SIGN_OK");
        assert_eq!(keys[1].key_type, KeyType::Signature);
        assert_eq!(keys[1].risk_level, RiskLevel::Low);
    }

    #[test]
    fn lua_static_hook_uses_x0_when_x1_is_a_length() {
        let (_guard, mut emu) = fixture();
        let key = emu.malloc(16);
        emu.mem_write_string(key, "STATICKEY").unwrap();

        emu.set_x(0, key).unwrap();
        emu.set_x(1, 9).unwrap();
        emu.set_x(3, 0).unwrap();
        emu.set_x(4, 0).unwrap();

        let hook = make_xxtea_key_hook("setXXTeaKey".to_string());
        hook(&mut emu);

        let keys = captured_keys();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].value, "STATICKEY");
    }

    #[test]
    fn std_string_setter_reads_key_and_signature() {
        let (_guard, mut emu) = fixture();
        let key_obj = emu.malloc(24);
        let sign_obj = emu.malloc(24);
        write_sso_string(&mut emu, key_obj, "CRYPTOKEY").unwrap();
        write_sso_string(&mut emu, sign_obj, "SIGNVALUE").unwrap();

        emu.set_x(0, emu.get_mock_object()).unwrap();
        emu.set_x(1, key_obj).unwrap();
        emu.set_x(2, sign_obj).unwrap();

        let hook = make_std_string_setter_hook("setCryptoKeyAndSign".to_string());
        hook(&mut emu);

        let keys = captured_keys();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].value, "CRYPTOKEY");
        assert_eq!(keys[1].value, "SIGNVALUE");
        assert_eq!(keys[1].key_type, KeyType::Signature);
    }

    #[test]
    fn non_printable_values_are_dropped() {
        let (_guard, mut emu) = fixture();
        let key = emu.malloc(16);
        emu.mem_write(key, &[0x01, 0x02, 0x03, 0x00]).unwrap();

        emu.set_x(0, key).unwrap();
        emu.set_x(1, 3).unwrap();
        emu.set_x(3, 0).unwrap();
        emu.set_x(4, 0).unwrap();

        let hook = make_xxtea_key_hook("setXXTeaKey".to_string());
        hook(&mut emu);

        assert!(captured_keys().is_empty());
    }

    #[test]
    fn generic_hook_scans_argument_registers() {
        let (_guard, mut emu) = fixture();
        let key = emu.malloc(32);
        emu.mem_write_string(key, "AESKEY1234567890").unwrap();

        emu.set_x(0, 0).unwrap();
        emu.set_x(1, key).unwrap();
        emu.set_x(2, 0).unwrap();

        let hook = make_generic_key_hook("setAESKey".to_string(), KeyType::Aes);
        hook(&mut emu);

        let keys = captured_keys();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].value, "AESKEY1234567890");
        assert_eq!(keys[0].key_type, KeyType::Aes);
        assert_eq!(keys[0].risk_level, RiskLevel::High);
    }

    #[test]
    fn key_capture_survives_a_real_emulated_call() {
        let (_guard, mut emu) = fixture();
        let key = emu.malloc(16);
        emu.mem_write_string(key, "RUNTIMEKEY").unwrap();

        // BL to a hooked body one page in, then stop back at the call site.
        let target = crate::emu::CODE_BASE + 0x1000;
        emu.mem_write(crate::emu::CODE_BASE, &0x9400_0400u32.to_le_bytes())
            .unwrap(); // BL +0x1000
        emu.mem_write(crate::emu::CODE_BASE + 4, &crate::emu::RET_INSN)
            .unwrap();
        emu.mem_write(target, &crate::emu::RET_INSN).unwrap();
        emu.hook_address(target, make_xxtea_key_hook("setXXTeaKey".to_string()));
        emu.hook_address(
            crate::emu::CODE_BASE + 4,
            std::rc::Rc::new(|_e: &mut Emulator| true),
        );

        emu.set_x(0, key).unwrap();
        emu.set_x(1, 10).unwrap();
        emu.set_x(3, 0).unwrap();
        emu.set_x(4, 0).unwrap();

        let result = emu.run_from(crate::emu::CODE_BASE);
        assert!(result.is_ok(), "{result:?}");

        let keys = captured_keys();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].value, "RUNTIMEKEY");
        assert_eq!(keys[0].key_type, KeyType::Xxtea);
    }

    #[test]
    fn capture_direct_infers_key_type() {
        let (_guard, emu) = fixture();
        capture_key_direct(&emu, "K", "vtable[2]->setCryptoKeyAndSign", 0x1000);
        capture_key_direct(&emu, "\u{1}", "vtable[2]->setCryptoKeyAndSign", 0x1000);

        let keys = captured_keys();
        assert_eq!(keys.len(), 1, "non-printable capture dropped");
        assert_eq!(keys[0].key_type, KeyType::Crypto);
    }
}
