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

//! The content-addressable store: a local, immutable-once-written blob
//! store keyed by [`Digest`]. See [`local::LocalCas`] for the on-disk
//! layout and eviction policy.

mod local;
#[cfg(test)]
mod tests;

pub use local::{EvictionSummary, LocalCas};

use bytes::Bytes;
use hashing::Digest;

use errors::BuildError;

/// The four read/write primitives every caller of the store needs.
/// Implemented by [`LocalCas`]; kept as a trait so the Sandbox and Action
/// Cache crates can be written against the interface rather than the
/// concrete store type.
#[async_trait::async_trait]
pub trait ContentAddressableStore: Send + Sync {
    /// Idempotent: writing the same bytes twice yields the same digest and
    /// the second write is a no-op beyond refreshing the LRU clock.
    async fn put(&self, bytes: Bytes) -> Result<Digest, BuildError>;

    /// `None` means the digest is not present locally.
    async fn get(&self, digest: Digest) -> Result<Option<Bytes>, BuildError>;

    async fn has(&self, digest: Digest) -> Result<bool, BuildError>;

    /// Materialize the blob at `dest_path`, hard-linking from the store
    /// where possible and falling back to a copy (e.g. across filesystem
    /// boundaries). The destination is left read-only.
    async fn link(&self, digest: Digest, dest_path: &std::path::Path) -> Result<(), BuildError>;
}
