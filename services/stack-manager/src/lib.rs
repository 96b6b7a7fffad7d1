//! Stack lifecycle manager.
//!
//! This crate primarily ships the `stackd` binary, but exposes a library
//! surface to enable integration testing and reuse.

pub mod api;
pub mod cleanup;
pub mod config;
pub mod db;
pub mod gateway;
pub mod scheduler;
pub mod stack;
pub mod state;
