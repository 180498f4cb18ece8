//! # rtbench-core
//!
//! Low-level host primitives used by the rtbench lifecycle layer.
//!
//! This crate provides safe abstractions over:
//! - **Memory accounting**: parsing `/proc/meminfo` into a used-memory figure.
//! - **Network namespaces**: named, bind-mounted namespaces under `/var/run/netns`.
//! - **CNI**: loading network configuration and executing plugin binaries.
//!
//! All system calls are wrapped with proper error mapping into
//! [`rtbench_common::error::BenchError`].

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod cni;
pub mod meminfo;
pub mod namespace;
