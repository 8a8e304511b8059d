//! Compile-time defaults, generated by build.rs
//!
//! Override at build time with `STRAND_CONFIG_RS=/path/to/strand_config.rs`.

include!(concat!(env!("OUT_DIR"), "/strand_config.rs"));
