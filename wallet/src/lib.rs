//! Key-controlled chain accounts: sequence-number ownership, cached balances,
//! signing and deterministic child derivation.

pub mod account;
pub mod derive;

pub use account::{transfer_request, Account, NonceSnapshot};
pub use derive::derive_child_key;
