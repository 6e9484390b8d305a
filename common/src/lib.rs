//! Shared building blocks for the flood workspace: error taxonomy, configuration
//! primitives, logging setup, supervised background tasks and fee unit helpers.

// Re-exports for common crate
pub mod prelude {
    // External types
    pub use ethers::core::types::{Address, H256, U256};

    // Common modules
    pub use crate::error::{FloodError, FloodResult, RejectionKind, RpcError};
    pub use crate::task::spawn_supervised;
    pub use crate::units::{gwei_to_wei, wei_to_gwei};
}

pub mod config;
pub mod error;
pub mod logger;
pub mod task;
pub mod units;
