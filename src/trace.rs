//! Trace event model. Events describe stub and hook activity during a run;
//! nothing in the core depends on them, they exist for the renderer.

use std::collections::HashMap;
use std::time::SystemTime;

// Standard tags, stored without the leading '#'.
pub const TAG_SETTER: &str = "setter";
pub const TAG_KEY: &str = "key";
pub const TAG_JNI_CALL: &str = "jni-call";
pub const TAG_MALLOC: &str = "malloc";
pub const TAG_STRING: &str = "string";
pub const TAG_CRYPTO: &str = "crypto";
pub const TAG_NETWORK: &str = "network";
pub const TAG_FILE: &str = "file";
pub const TAG_DYNLOAD: &str = "dynload";
pub const TAG_LUA: &str = "lua";
pub const TAG_TOLUA: &str = "tolua";
pub const TAG_FALLBACK: &str = "fallback";

/// A single observed stub call or hook firing.
#[derive(Clone, Debug)]
pub struct Event {
    /// Guest return address of the call that reached the stub.
    pub pc: u64,
    /// Hashtags, first is primary.
    pub tags: Vec<String>,
    /// Function name, e.g. "malloc" or "FindClass".
    pub name: String,
    /// Call-specific detail, e.g. "size=24".
    pub detail: String,
    pub annotations: HashMap<String, String>,
    pub timestamp: SystemTime,
}

impl Event {
    pub fn new(pc: u64, category: &str, name: &str, detail: &str) -> Event {
        Event {
            pc,
            tags: vec![category.to_string()],
            name: name.to_string(),
            detail: detail.to_string(),
            annotations: HashMap::new(),
            timestamp: SystemTime::now(),
        }
    }

    pub fn add_tag(&mut self, tag: &str) {
        if !self.tags.iter().any(|t| t == tag) {
            self.tags.push(tag.to_string());
        }
    }

    pub fn annotate(&mut self, key: &str, value: &str) {
        self.annotations.insert(key.to_string(), value.to_string());
    }

    /// Primary tag with '#' prefix, empty when untagged.
    pub fn primary_tag(&self) -> String {
        match self.tags.first() {
            Some(tag) => format!("#{tag}"),
            None => String::new(),
        }
    }

    /// All tags with '#' prefixes, for display.
    pub fn tag_strings(&self) -> Vec<String> {
        self.tags.iter().map(|t| format!("#{t}")).collect()
    }
}

/// Adds secondary tags based on (category, name).
pub fn default_enricher(e: &mut Event) {
    let Some(category) = e.tags.first().cloned() else {
        return;
    };

    match category.as_str() {
        "setter" => {
            e.add_tag(TAG_KEY);
            e.annotate("type", "xxtea");
        }
        "jni" => e.add_tag(TAG_JNI_CALL),
        "libc" => match e.name.as_str() {
            "malloc" | "calloc" | "realloc" | "free" | "new" | "delete" => e.add_tag(TAG_MALLOC),
            "memcpy" | "memmove" | "memset" => e.add_tag(TAG_STRING),
            "open" | "openat" | "stat" | "fs-op" => e.add_tag(TAG_FILE),
            _ => {}
        },
        "lua" => e.add_tag(TAG_LUA),
        "tolua" => e.add_tag(TAG_TOLUA),
        "network" => e.add_tag(TAG_NETWORK),
        "android" => {
            if e.name.starts_with("dl") {
                e.add_tag(TAG_DYNLOAD);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enricher_tags_by_category() {
        let mut e = Event::new(0x1000, "setter", "setXXTeaKey", "KEY");
        default_enricher(&mut e);
        assert_eq!(e.primary_tag(), "#setter");
        assert!(e.tags.iter().any(|t| t == TAG_KEY));
        assert_eq!(e.annotations.get("type").unwrap(), "xxtea");

        let mut e = Event::new(0x1000, "libc", "malloc", "size=16");
        default_enricher(&mut e);
        assert!(e.tags.iter().any(|t| t == TAG_MALLOC));

        let mut e = Event::new(0x1000, "android", "dlopen", "libfoo.so");
        default_enricher(&mut e);
        assert!(e.tags.iter().any(|t| t == TAG_DYNLOAD));
    }

    #[test]
    fn tags_do_not_duplicate() {
        let mut e = Event::new(0, "lua", "lua_getglobal", "");
        default_enricher(&mut e);
        default_enricher(&mut e);
        assert_eq!(e.tags.iter().filter(|t| *t == TAG_LUA).count(), 1);
    }
}
