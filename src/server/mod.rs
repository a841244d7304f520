//! gRPC service mode.
//!
//! - Generated protobuf types (`proto`)
//! - Type conversions between native and proto types (`convert`)
//! - The gRPC service implementation (`service`)
//! - Daemon configuration (`config`)

pub mod config;
pub mod convert;
pub mod service;

/// Re-exported generated proto types.
pub mod proto {
    tonic::include_proto!("promptgate.v1");
}

pub use service::PromptgateService;
