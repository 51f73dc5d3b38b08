//! Background loops for continuous processing.

pub mod feed_loop;
pub mod rule_loop;
pub mod safety_loop;
