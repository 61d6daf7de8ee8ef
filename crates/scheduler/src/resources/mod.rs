//! Resource accounting
//!
//! Requests come in as floating-point maps and are validated into fixed-point
//! [`ResourceSet`]s before they ever touch the [`ResourceLedger`].

mod ledger;
mod quantity;
mod request;

pub use ledger::{LeaseGuard, LedgerError, Rejection, ResourceLedger};
pub use quantity::{Quantity, UNITS_PER_RESOURCE};
pub use request::{ResourceRequest, ResourceSet, CPU, GPU, MEMORY};
