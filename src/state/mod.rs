//! Cached-state tables and the constraint accumulator (§4.1, §4.2).

pub mod constraint;
pub mod guest;
pub mod host;
