//! Process entry points for the `prerender` binary.

pub mod start;
