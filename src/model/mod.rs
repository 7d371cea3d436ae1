//! Stream record types.

pub mod tweet;
