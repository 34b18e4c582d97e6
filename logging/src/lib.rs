// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
#![allow(clippy::match_ref_pats)]
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
#![allow(clippy::mutex_atomic)]

//! Process-wide logging initialization. Every binary in this workspace
//! (coordinator, worker, CLI) calls [`init`] exactly once at startup; every
//! other crate just logs through the `log` facade macros.

pub mod logger;

pub use logger::Verbosity;

/// Initialize the global logger for the process. `-q`/`-v`/`-vv` map onto
/// `Verbosity::{Quiet,Normal,Verbose,Trace}`; `use_color` should usually be
/// `io::stdout().is_terminal()`.
pub fn init(verbosity: Verbosity, use_color: bool) {
    logger::init(verbosity, use_color)
}
