//! Transport Layer
//!
//! Abstraction over the messaging protocol.
//!
//! - [`MatrixSdkTransport`]: Matrix client with end-to-end encryption
//! - [`MatrixHttpTransport`]: Matrix client-server API over HTTP, unencrypted
//!   rooms only
//! - [`InProcessTransport`]: channel-backed, records every outbound call

pub mod in_process;
pub mod matrix_http;
pub mod matrix_sdk_client;
pub mod traits;

pub use in_process::{InProcessTransport, SentMessage};
pub use matrix_http::MatrixHttpTransport;
pub use matrix_sdk_client::MatrixSdkTransport;
pub use traits::{ChatTransport, DeviceInfo, TransportError};
