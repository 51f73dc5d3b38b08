//! SkyWatch feed - telemetry collaborator contract
//!
//! Wire messages for snapshot/update/new/remove/hazard frames, and a
//! WebSocket client with correlated, time-limited requests.

pub mod client;
pub mod error;
pub mod protocol;
pub mod requests;

pub use client::FeedClient;
pub use error::FeedError;
pub use protocol::{ClientMessage, FeedMessage};
pub use requests::{PendingRequest, RequestTracker};
