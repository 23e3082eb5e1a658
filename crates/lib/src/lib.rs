//! keg-lib: Core orchestration for keg
//!
//! This crate builds a single package from a declarative formula descriptor:
//! - `formula`: the immutable descriptor (metadata, checksummed sources, typed install steps)
//! - `digest`: SHA-256 verification of downloaded content
//! - `cache`: the shared, atomically-published download cache
//! - `fetch`: download, verify, and stage archives into the build tree
//! - `tree`: the isolated temporary build tree with guaranteed teardown
//! - `descriptor`: template rendering for the generated build description
//! - `executor`: scoped configure/compile/install toolchain invocation
//! - `verify`: the post-install compile-and-run smoke test
//! - `pipeline`: the stage machine driving all of the above in order

pub mod cache;
pub mod descriptor;
pub mod digest;
pub mod executor;
pub mod fetch;
pub mod formula;
pub mod pipeline;
pub mod tree;
pub mod verify;
