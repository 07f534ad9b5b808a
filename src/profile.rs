//! Optional YAML run profile, for binaries that need a nudge: a known entry
//! symbol, a fixed load base, or a different instruction ceiling.

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct Profile {
    /// Preferred entry symbol, matched exact / case-insensitive / substring.
    pub entry: Option<String>,
    /// Explicit load base; omit for automatic rebasing.
    pub load_base: Option<u64>,
    /// Hard instruction ceiling for the run.
    pub max_insn: Option<u64>,
}

pub fn load_profile(path: &str) -> Result<Profile> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read profile {path}"))?;
    Ok(serde_yaml::from_str(&s)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_profiles() {
        let p: Profile = serde_yaml::from_str("entry: JNI_OnLoad\nmax_insn: 5000\n").unwrap();
        assert_eq!(p.entry.as_deref(), Some("JNI_OnLoad"));
        assert_eq!(p.load_base, None);
        assert_eq!(p.max_insn, Some(5000));

        let p: Profile = serde_yaml::from_str("load_base: 1073741824\n").unwrap();
        assert_eq!(p.load_base, Some(0x4000_0000));
    }
}
