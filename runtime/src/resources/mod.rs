//! Sub-resource policy: which page assets load during a render, and the
//! process-wide cache that memoizes those decisions.

pub mod cache;
pub mod filter;

pub use cache::ResourceCache;
pub use filter::{ResourceFilter, SkipList, SkipRule};
