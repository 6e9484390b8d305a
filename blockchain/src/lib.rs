//! RPC access for the flood workspace: the [`RpcClient`] seam over JSON-RPC, the
//! [`Endpoint`] wrapper that counts requests and tracks health, and the
//! [`EndpointPool`] that selects among endpoints and health-checks them in the background.

pub mod client;
pub mod endpoint;
pub mod pool;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::{EthersClient, RpcClient};
pub use endpoint::{Endpoint, EndpointSpec, EndpointStats, FeeSnapshot};
pub use pool::{EndpointPool, EndpointPoolConfig, SelectionMode};
