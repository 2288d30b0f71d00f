//! Push Core Types
//!
//! Data model shared by the dispatch engine, provider adapters and transport.

mod config;
mod notification;
mod outcome;

pub use config::*;
pub use notification::*;
pub use outcome::*;
