//! # rtbench-common
//!
//! Shared configuration record, error definitions, constants, and domain
//! types used across the whole rtbench workspace.
//!
//! This crate is the leaf of the dependency graph. It depends on no other
//! internal crate and provides the primitives the lifecycle layer and the
//! measurement drivers build upon.

pub mod config;
pub mod constants;
pub mod error;
pub mod types;
