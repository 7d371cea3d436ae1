//! Structured activity logging: JSONL file written by a dedicated logger thread.

pub mod activity;
pub mod jsonl;
