//! Transaction load generation on top of a shared dispatch substrate.
//!
//! [`dispatch::DispatchEngine`] submits and confirms transactions, the
//! [`account_pool::AccountPool`] owns funded child accounts, and the
//! [`driver::Driver`] paces scenario production.

pub mod account_pool;
pub mod config;
pub mod dispatch;
pub mod driver;
pub mod scenario;

pub use account_pool::{AccountPool, AccountPoolConfig, AccountSelection, RootAccount};
pub use config::FloodConfig;
pub use dispatch::{DispatchConfig, DispatchEngine, SendOptions};
pub use driver::{Driver, DriverOptions, DriverReport, DriverState, SlotGuard, TxProducer};
pub use scenario::{Scenario, ScenarioOptions};
