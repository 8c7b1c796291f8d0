//! Embedded single-file persistent key/value store.
//!
//! Three layers, leaves first:
//!
//! - [`alloc`]: a buddy-style allocator over a flat address space.
//! - [`store`]: a self-describing byte store (allocator metadata, a
//!   named-cell directory, and arbitrary binary blobs) built on top of a
//!   [`stream::ByteStream`].
//! - [`btree`] + [`mapping`]: an ordered map whose nodes are blobs inside
//!   the store, with a write-back node cache that performs batched,
//!   relocation-aware flushes.
//!
//! [`Mapping`] is the typical entry point: it opens (or creates) a named
//! B+Tree inside a shared [`Store`].

pub mod alloc;
pub mod btree;
pub mod descriptor;
pub mod error;
pub mod mapping;
pub mod serialize;
pub mod store;
pub mod stream;

pub use error::{Error, Result};
pub use mapping::{Mapping, MappingOptions};
pub use store::{Store, StoreOptions};
pub use stream::{ByteStream, FileStream, InMemoryStream, OpenMode};

/// Installs a `tracing` subscriber once, gated by `RUST_LOG`. Several
/// stress tests across the crate call this first so `RUST_LOG=trace
/// cargo test -- --nocapture` surfaces the allocator/flush instrumentation
/// added throughout (`alloc.rs`, `store.rs`, `mapping/provider.rs`).
#[cfg(test)]
pub(crate) fn init_test_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
