//! Rhai plugin engine.
//!
//! Rhai has a Rust-like syntax and ships inside the host binary, so
//! plugins written against the host's own idiom can be dropped in as
//! `.rhai` files. Public script functions of one parameter are the plugin's
//! exports.

mod bindings;
mod runtime;

pub use runtime::RhaiEngine;
