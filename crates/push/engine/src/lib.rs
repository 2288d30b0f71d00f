//! Push Dispatch Engine
//!
//! Admission, queueing, worker pool, retry and stats folding for push
//! notification batches.

mod admission;
mod engine;
mod retry;
mod traits;
mod worker;

pub use admission::*;
pub use engine::*;
pub use retry::*;
pub use traits::*;
