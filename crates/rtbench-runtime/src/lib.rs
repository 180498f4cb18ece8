//! Container lifecycle for the rtbench drivers.
//!
//! [`lifecycle::Lifecycle`] hides the multi-step supervisor protocol behind
//! pull, create-and-start, and teardown. The supervisor and host networking
//! sit behind traits so the protocol order can be verified with the fakes
//! in [`testing`].

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod connection;
pub mod lifecycle;
pub mod network;
pub mod spec;
pub mod supervisor;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
