//! Linux namespace management for benchmark containers.
//!
//! Only network namespaces are created by the harness; the runtime shim
//! creates every other namespace itself from the OCI spec.

pub mod network;

pub use network::NetNs;
