//! kiln: an on-demand, hot-reloading compile cache serving script and
//! template handlers for a small multi-site HTTP host.

pub mod application;
pub mod backend;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
pub mod template;
