// Chain, ledger state and submission validation live under `blockchain/core/`
// so each concern can grow independently.

pub mod core;
pub use core::*;
