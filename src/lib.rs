//! apimend library crate
//!
//! Repairs failing HTTP API tests and generates tests for uncovered endpoint
//! scenarios. Every file edit goes through the capability surface and is
//! backed up first, so anything the agent does can be rolled back.

pub mod backup;
pub mod capability;
pub mod cleanup;
pub mod config;
pub mod coverage;
pub mod engine;
pub mod error;
pub mod failure;
pub mod generate;
pub mod heal;
pub mod report;
pub mod util;
pub mod workflow;

#[cfg(test)]
pub(crate) mod test_support;
