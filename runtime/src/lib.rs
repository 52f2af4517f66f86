// Copyright 2026 Prerender Contributors
// SPDX-License-Identifier: Apache-2.0

//! Prerender runtime library: a server-side rendering proxy.
//!
//! This library crate exposes the core modules for integration testing.

pub mod cli;
pub mod config;
pub mod error;
pub mod maintenance;
pub mod outcome;
pub mod renderer;
pub mod request;
pub mod resources;
pub mod server;
