//! Build script for strand-runtime
//!
//! Produces the compile-time configuration defaults:
//! 1. Start with library defaults
//! 2. If STRAND_CONFIG_RS names a file, read its `pub const` overrides
//! 3. Overrides win; unknown names are reported as warnings
//! 4. Write OUT_DIR/strand_config.rs
//!
//! An override file only lists the values it changes.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

struct ConfigParam {
    name: &'static str,
    rust_type: &'static str,
    default_value: &'static str,
}

const CONFIG_PARAMS: &[ConfigParam] = &[
    ConfigParam {
        name: "STACK_SIZE",
        rust_type: "usize",
        default_value: "128 * 1024",
    },
    ConfigParam {
        name: "NUM_THREADS",
        rust_type: "usize",
        default_value: "1",
    },
    ConfigParam {
        name: "USE_CALLER",
        rust_type: "bool",
        default_value: "true",
    },
    ConfigParam {
        name: "MAX_WAIT_MS",
        rust_type: "u64",
        default_value: "3000",
    },
    ConfigParam {
        name: "MAX_EVENTS",
        rust_type: "usize",
        default_value: "64",
    },
    ConfigParam {
        name: "CONNECT_TIMEOUT_MS",
        rust_type: "u64",
        default_value: "5000",
    },
    ConfigParam {
        name: "CLOCK_ROLLOVER_MS",
        rust_type: "u64",
        default_value: "60 * 60 * 1000",
    },
    ConfigParam {
        name: "FD_TABLE_INITIAL",
        rust_type: "usize",
        default_value: "64",
    },
    ConfigParam {
        name: "DEBUG_LOGGING",
        rust_type: "bool",
        default_value: "false",
    },
];

const OVERRIDE_VAR: &str = "STRAND_CONFIG_RS";

fn main() {
    let out_dir = env::var("OUT_DIR").expect("OUT_DIR not set");
    let dest_path = Path::new(&out_dir).join("strand_config.rs");

    let mut config: HashMap<&str, String> = CONFIG_PARAMS
        .iter()
        .map(|p| (p.name, p.default_value.to_string()))
        .collect();

    let user_path = env::var(OVERRIDE_VAR).ok();
    if let Some(path) = &user_path {
        println!("cargo:rerun-if-changed={}", path);
        match fs::read_to_string(path) {
            Ok(content) => {
                merge_overrides(&content, &mut config);
                println!("cargo:warning=Using custom config: {}", path);
            }
            Err(e) => {
                println!("cargo:warning=Failed to read {} ({}): {}", OVERRIDE_VAR, path, e);
            }
        }
    }
    println!("cargo:rerun-if-env-changed={}", OVERRIDE_VAR);

    let output = render(&config, user_path.as_deref());
    fs::write(&dest_path, output).expect("Failed to write merged config");
}

/// Apply every known `pub const NAME: TYPE = VALUE;` line from `content`
fn merge_overrides(content: &str, config: &mut HashMap<&str, String>) {
    for line in content.lines().map(str::trim) {
        if !line.starts_with("pub const ") {
            continue;
        }
        let Some((name, value)) = split_const(line) else {
            continue;
        };
        match CONFIG_PARAMS.iter().find(|p| p.name == name) {
            Some(param) => {
                config.insert(param.name, value);
            }
            None => println!("cargo:warning=Unknown config parameter: {}", name),
        }
    }
}

/// `pub const NAME: TYPE = VALUE;` -> (NAME, VALUE)
fn split_const(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix("pub const ")?.trim();
    let (name, rest) = rest.split_once(':')?;
    let (_, value) = rest.split_once('=')?;
    let value = value.trim().trim_end_matches(';').trim();
    if value.is_empty() {
        return None;
    }
    Some((name.trim().to_string(), value.to_string()))
}

fn render(config: &HashMap<&str, String>, user_path: Option<&str>) -> String {
    let mut output = String::from("// Generated by strand-runtime/build.rs\n");
    match user_path {
        Some(path) => output.push_str(&format!("// Library defaults merged with {}\n\n", path)),
        None => output.push_str("// Library defaults\n\n"),
    }
    for param in CONFIG_PARAMS {
        let value = &config[param.name];
        output.push_str(&format!(
            "pub const {}: {} = {};\n",
            param.name, param.rust_type, value
        ));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_const() {
        assert_eq!(
            split_const("pub const NUM_THREADS: usize = 8;"),
            Some(("NUM_THREADS".into(), "8".into()))
        );
        assert_eq!(
            split_const("pub const STACK_SIZE: usize = 256 * 1024;"),
            Some(("STACK_SIZE".into(), "256 * 1024".into()))
        );
        assert_eq!(split_const("pub const BROKEN: usize =;"), None);
    }

    #[test]
    fn test_merge_overrides() {
        let mut config: HashMap<&str, String> = HashMap::new();
        config.insert("NUM_THREADS", "1".into());
        config.insert("USE_CALLER", "true".into());

        merge_overrides(
            "// tuned for the echo box\npub const NUM_THREADS: usize = 4;\npub const USE_CALLER: bool = false;\n",
            &mut config,
        );

        assert_eq!(config["NUM_THREADS"], "4");
        assert_eq!(config["USE_CALLER"], "false");
    }
}
