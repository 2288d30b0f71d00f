//! Push Providers
//!
//! Provider adapters that turn a notification into a delivery attempt against
//! APNs or FCM, and the registry the dispatch engine resolves them from.

mod apns;
mod fcm;
mod registry;
mod traits;

pub use apns::*;
pub use fcm::*;
pub use registry::*;
pub use traits::*;
