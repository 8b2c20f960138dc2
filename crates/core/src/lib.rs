//! Shared types, the `Disposable` contract, and error definitions.
//!
//! Foundation crate -- no threads or I/O.

pub mod error;
pub mod panic;
pub mod types;

pub use error::{TetherError, TetherResult};
pub use panic::panic_message;
pub use types::{
    erase, AccessKind, Disposable, DisposableRef, NamedDisposable, ObjectKey, OnDispose,
    PromiseStatus,
};
