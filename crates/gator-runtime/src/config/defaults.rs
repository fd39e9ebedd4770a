//! Compile-time defaults generated by `build.rs`
//!
//! Override any of them by pointing `GATOR_CONFIG_RS` at a file of
//! `pub const NAME: TYPE = VALUE;` lines before building.

include!(concat!(env!("OUT_DIR"), "/gator_defaults.rs"));
