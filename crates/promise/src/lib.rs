//! Cancellable promises: a tagged `Pending | Fulfilled | Rejected | Cancelled`
//! state behind one mutation point, with callbacks, blocking and async
//! waiting, and combinators.

pub mod combinators;
pub mod error;
pub mod promise;
mod state;

pub use combinators::collect_results;
pub use error::{rejection, PromiseError, Rejection, RejectionMessage};
pub use promise::{AsyncPromise, CancelOnDispose, PromiseFuture};
