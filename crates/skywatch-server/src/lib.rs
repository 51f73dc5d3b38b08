//! Shared library surface for the skywatch server and its tests.

pub mod ack;
pub mod api;
pub mod backoff;
pub mod config;
pub mod escalation;
pub mod loops;
pub mod notify;
pub mod persistence;
pub mod preview;
pub mod state;
