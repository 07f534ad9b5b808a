use anyhow::{Context, Result, bail};
use env_logger::Env;
use log::LevelFilter;
use std::path::PathBuf;

use galago::driver::{self, RunConfig, is_block_end};
use galago::emu::Emulator;
use galago::profile;
use galago::stubs::setters::{CapturedKey, KeyType};

const USAGE: &str = "\
galago - extract encryption keys from ARM64 Android native libraries

Usage:
  galago [flags] <binary.so | directory>
  galago info <binary.so>

Flags:
  -q          quiet mode (keys and stats only)
  -v          verbose debug output
  -n <count>  max instructions to show (default 500)
  -p <file>   YAML run profile (entry, load_base, max_insn)";

struct Options {
    verbose: bool,
    quiet: bool,
    max_show: u64,
    profile: Option<String>,
    info: bool,
    path: Option<String>,
}

fn parse_args() -> Result<Options> {
    let mut opts = Options {
        verbose: false,
        quiet: false,
        max_show: 500,
        profile: None,
        info: false,
        path: None,
    };

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-q" | "--quiet" => opts.quiet = true,
            "-v" | "--verbose" => opts.verbose = true,
            "-n" | "--num" => {
                let value = args.next().context("-n needs a count")?;
                opts.max_show = value.parse().context("-n count must be a number")?;
            }
            "-p" | "--profile" => {
                opts.profile = Some(args.next().context("-p needs a file")?);
            }
            "-h" | "--help" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            "info" if opts.path.is_none() && !opts.info => opts.info = true,
            _ if arg.starts_with('-') => bail!("unknown flag {arg}\n{USAGE}"),
            _ => {
                if opts.path.is_some() {
                    bail!("unexpected argument {arg}\n{USAGE}");
                }
                opts.path = Some(arg);
            }
        }
    }

    Ok(opts)
}

/// A directory argument means "the first .so inside it".
fn resolve_binary(path: &str) -> Result<PathBuf> {
    let p = PathBuf::from(path);
    if p.is_dir() {
        let pattern = p.join("*.so").to_string_lossy().to_string();
        return glob::glob(&pattern)?
            .next()
            .ok_or_else(|| anyhow::anyhow!(".so file not found in {}", p.display()))?
            .map_err(Into::into);
    }
    if !p.is_file() {
        bail!("file not found: {}", p.display());
    }
    Ok(p)
}

fn main() -> Result<()> {
    let opts = parse_args()?;

    let default_level = if opts.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_level))
        .filter_level(if opts.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Warn
        })
        .init();

    let Some(path) = opts.path.as_deref() else {
        println!("{USAGE}");
        std::process::exit(1);
    };
    let binary = resolve_binary(path)?;

    if opts.info {
        return show_info(&binary);
    }

    galago::stubs::DEBUG.store(opts.verbose, std::sync::atomic::Ordering::Relaxed);

    let mut config = RunConfig {
        trace: !opts.quiet,
        trace_limit: opts.max_show,
        ..RunConfig::default()
    };
    if let Some(profile_path) = &opts.profile {
        let p = profile::load_profile(profile_path)?;
        if let Some(entry) = p.entry {
            config.preferred_entry = entry;
        }
        if let Some(base) = p.load_base {
            config.load_base = base;
        }
        if let Some(max) = p.max_insn {
            config.max_insn = max;
        }
    }

    let outcome = driver::run(&binary, &config)?;

    if opts.quiet {
        print_quiet_summary(&binary, &outcome);
    } else {
        print_header(&binary, &outcome);
        print_trace(&outcome);
        print_keys(&outcome.keys);
        print_stats(&outcome);
    }

    Ok(())
}

fn print_header(binary: &PathBuf, outcome: &driver::RunOutcome) {
    println!();
    println!("galago - ARM64 emulation trace analyzer");
    println!("  Loading: {}", binary.display());
    println!(
        "  Base: 0x{:x}  Entry: 0x{:x}",
        outcome.base_addr, outcome.entry
    );
    println!(
        "  Imports: {}  Symbols: {}  Hooks: {}",
        outcome.import_count, outcome.symbol_count, outcome.hooks_installed
    );
    if !outcome.entry_name.is_empty() {
        println!("  Entry point: {}", outcome.entry_name);
    }
    println!();
}

fn print_trace(outcome: &driver::RunOutcome) {
    for record in &outcome.trace {
        let hex = format!(
            "{:02X}{:02X}{:02X}{:02X}",
            record.code[3], record.code[2], record.code[1], record.code[0]
        );
        let mut line = format!("{:08x}  {}  {:<40}", record.addr, hex, record.disasm);

        let mut tags: Vec<String> = driver::instruction_tags(&record.disasm)
            .iter()
            .map(|t| t.to_string())
            .collect();
        let mut comments: Vec<String> = Vec::new();
        for event in &record.events {
            tags.extend(event.tag_strings());
            if !event.detail.is_empty() {
                comments.push(event.detail.clone());
            }
        }
        if !tags.is_empty() || !comments.is_empty() {
            line.push_str("; ");
            line.push_str(&tags.join(" "));
            if !comments.is_empty() {
                if !tags.is_empty() {
                    line.push(' ');
                }
                line.push_str(&comments.join(", "));
            }
        }

        if let Some(func) = &record.func_name {
            line.push_str(&format!("  <{func}>"));
        }
        for event in &record.events {
            if !event.name.is_empty() {
                line.push_str(&format!(" {}", event.name));
            }
        }

        println!("{}", line.trim_end());
        if is_block_end(&record.disasm) {
            println!();
        }
    }
}

fn print_keys(keys: &[CapturedKey]) {
    if keys.is_empty() {
        return;
    }
    println!();
    let mut i = 0;
    while i < keys.len() {
        let k = &keys[i];
        if k.key_type == KeyType::Xxtea
            && i + 1 < keys.len()
            && keys[i + 1].key_type == KeyType::Signature
        {
            println!("xxtea = {:?}  signature = {:?}", k.value, keys[i + 1].value);
            i += 2;
        } else {
            println!("{} = {:?}", k.key_type, k.value);
            i += 1;
        }
    }
}

fn print_stats(outcome: &driver::RunOutcome) {
    println!();
    print!(
        "----------------------------------------- {} insn  {} keys",
        outcome.insn_count,
        outcome.keys.len()
    );
    if let Some(fault) = &outcome.fault {
        print!("  {fault}");
    }
    println!();
}

fn print_quiet_summary(binary: &PathBuf, outcome: &driver::RunOutcome) {
    let name = binary
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    println!("{name}");

    print_keys(&outcome.keys);

    print!("{} insn", outcome.insn_count);
    if outcome.vtable_hits > 0 {
        print!("  {} hook", outcome.vtable_hits);
    }
    if outcome.stub_calls > 0 {
        print!("  {} stub", outcome.stub_calls);
    }
    if outcome.ret_count > 0 {
        print!("  {} ret", outcome.ret_count);
    }
    if outcome.br_count > 0 {
        print!("  {} br", outcome.br_count);
    }
    if outcome.xor_count > 0 {
        print!("  {} xor", outcome.xor_count);
    }
    println!();
    println!();
}

fn show_info(binary: &PathBuf) -> Result<()> {
    let mut emu = Emulator::new().context("create emulator")?;
    let info = emu.load_elf(binary).context("load binary")?;

    println!(
        "Binary: {}",
        binary.file_name().unwrap_or_default().to_string_lossy()
    );
    println!("Base:   0x{:x}", info.base_addr);
    println!("End:    0x{:x}", info.end_addr);
    println!("Entry:  0x{:x}", info.entry);
    println!("Symbols: {}", info.symbols.len());
    println!();

    println!("Key entry points:");
    let entry = info.find_entry_point("");
    if entry != 0 {
        println!("  Auto-detected: 0x{entry:x}");
    }
    let jni = info.find_jni_onload();
    if jni != 0 {
        println!("  JNI_OnLoad: 0x{jni:x}");
    }

    let interesting = [
        "JNI_OnLoad",
        "il2cpp_init",
        "cocos_android_app_init",
        "setXXTeaKey",
        "setCryptoKey",
    ];
    let mut found = false;
    for name in interesting {
        let mut matches: Vec<(String, u64)> =
            info.find_symbols_by_substring(name).into_iter().collect();
        matches.sort();
        for (sym, addr) in matches {
            if !found {
                println!("\nInteresting symbols:");
                found = true;
            }
            println!("  0x{addr:x} {sym}");
        }
    }

    Ok(())
}
