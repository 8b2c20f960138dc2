//! Hierarchical ownership tree with deterministic teardown.

pub mod disposer;
mod tree;

pub use disposer::{new_disposable, Disposer, DisposerConfig};
