//! keel control plane library.
//!
//! This crate primarily ships a `control-plane` binary, but we expose the
//! scheduler, leader election and controllers to enable integration testing
//! and reuse.

pub mod api;
pub mod config;
pub mod controllers;
pub mod leader;
pub mod manager;
pub mod scheduler;
pub mod state;

#[cfg(test)]
pub(crate) mod test_support;
