//! Shared application state.

pub mod events;
pub mod store;
pub mod telemetry;

pub use events::AppEvent;
pub use store::AppState;
pub use telemetry::TelemetryStore;
