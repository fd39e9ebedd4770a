//! Build script for gator-runtime
//!
//! Emits `OUT_DIR/gator_defaults.rs` with one constant per collector
//! default. A file named by `GATOR_CONFIG_RS` may override any of them
//! with `pub const NAME: TYPE = VALUE;` lines; unknown names are warned
//! about and ignored.

use std::env;
use std::fs;
use std::path::Path;

/// `(name, type, default)` for every compile-time default
const DEFAULTS: &[(&str, &str, &str)] = &[
    // Channel capacities, bytes, powers of two
    ("SUMMARY_BUFFER_SIZE", "u32", "1024"),
    ("BACKTRACE_BUFFER_SIZE", "u32", "128 * 1024"),
    ("NAME_BUFFER_SIZE", "u32", "64 * 1024"),
    ("COUNTER_BUFFER_SIZE", "u32", "64 * 1024"),
    ("BLOCK_COUNTER_BUFFER_SIZE", "u32", "128 * 1024"),
    ("ANNOTATE_BUFFER_SIZE", "u32", "64 * 1024"),
    ("SCHED_TRACE_BUFFER_SIZE", "u32", "128 * 1024"),
    ("GPU_TRACE_BUFFER_SIZE", "u32", "64 * 1024"),
    ("IDLE_BUFFER_SIZE", "u32", "32 * 1024"),
    // Overflow hysteresis
    ("SPACE_MARGIN", "u32", "200"),
    ("RECOVERY_MARGIN", "u32", "2000"),
    // Commit once a frame fills this fraction of its ring
    ("COMMIT_THRESHOLD_NUM", "u32", "3"),
    ("COMMIT_THRESHOLD_DEN", "u32", "4"),
    ("WAKE_DELAY_US", "u64", "1000"),
    ("TICK_HZ", "u32", "1000"),
    ("BACKTRACE_DEPTH", "u32", "0"),
    ("RESPONSE_TYPE", "u32", "1"),
    ("PIN_THREADS", "bool", "true"),
    ("READ_POLL_MS", "u64", "50"),
];

fn main() {
    println!("cargo:rerun-if-env-changed=GATOR_CONFIG_RS");

    let mut values: Vec<String> = DEFAULTS.iter().map(|d| d.2.to_string()).collect();
    let user_path = env::var("GATOR_CONFIG_RS").ok();
    if let Some(path) = &user_path {
        println!("cargo:rerun-if-changed={path}");
        match fs::read_to_string(path) {
            Ok(content) => {
                apply_overrides(&content, &mut values);
                println!("cargo:warning=gator defaults overridden from {path}");
            }
            Err(e) => println!("cargo:warning=cannot read GATOR_CONFIG_RS {path}: {e}"),
        }
    }

    let Ok(out_dir) = env::var("OUT_DIR") else {
        panic!("OUT_DIR not set");
    };
    let dest = Path::new(&out_dir).join("gator_defaults.rs");
    if let Err(e) = fs::write(&dest, render(&values, user_path.is_some())) {
        panic!("failed to write {}: {e}", dest.display());
    }
}

/// Split `pub const NAME: TYPE = VALUE;` into `(NAME, VALUE)`
fn split_const(line: &str) -> Option<(&str, &str)> {
    let rest = line.trim().strip_prefix("pub const ")?;
    let (name, rest) = rest.split_once(':')?;
    let (_, value) = rest.split_once('=')?;
    let value = value.trim().trim_end_matches(';').trim_end();
    Some((name.trim(), value))
}

fn apply_overrides(content: &str, values: &mut [String]) {
    for (name, value) in content.lines().filter_map(split_const) {
        match DEFAULTS.iter().position(|d| d.0 == name) {
            Some(i) => values[i] = value.to_string(),
            None => println!("cargo:warning=unknown gator default {name}"),
        }
    }
}

fn render(values: &[String], overridden: bool) -> String {
    let mut out = String::from("// Generated by build.rs\n");
    if overridden {
        out.push_str("// Includes overrides from GATOR_CONFIG_RS\n");
    }
    out.push('\n');
    for ((name, ty, _), value) in DEFAULTS.iter().zip(values) {
        out.push_str(&format!("pub const {name}: {ty} = {value};\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_const() {
        assert_eq!(split_const("pub const TICK_HZ: u32 = 250;"), Some(("TICK_HZ", "250")));
        assert_eq!(
            split_const("  pub const BACKTRACE_BUFFER_SIZE: u32 = 256 * 1024;"),
            Some(("BACKTRACE_BUFFER_SIZE", "256 * 1024"))
        );
        assert_eq!(split_const("// pub const X: u32 = 1;"), None);
    }

    #[test]
    fn test_overrides_keep_untouched_defaults() {
        let mut values: Vec<String> = DEFAULTS.iter().map(|d| d.2.to_string()).collect();
        apply_overrides(
            "// tuned\npub const TICK_HZ: u32 = 100;\npub const NOPE: u8 = 1;\n",
            &mut values,
        );
        let get = |name: &str| {
            let i = DEFAULTS.iter().position(|d| d.0 == name).unwrap();
            values[i].clone()
        };
        assert_eq!(get("TICK_HZ"), "100");
        assert_eq!(get("SPACE_MARGIN"), "200");
    }
}
