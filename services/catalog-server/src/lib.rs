//! Catalog API server library.
//!
//! This crate primarily ships a `catalog-server` binary, but we expose a small
//! library surface to enable integration testing and reuse.

pub mod api;
pub mod config;
pub mod health;
pub mod lifecycle;
pub mod report;
pub mod seed;
pub mod state;
pub mod store;
