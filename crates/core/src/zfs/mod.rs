//! `zfs` CLI wrapper for zrebase.

pub mod client;
pub mod parser;

pub use client::ZfsBackend;
pub use parser::*;
