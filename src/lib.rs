//! Debt-collection event correlation service.
//!
//! Debtors are reached by email, SMS, and voice, and pay through a hosted
//! payment processor. Every provider callback is verified, attributed to a
//! debtor, and appended to a deduplicated ledger; a debtor's case status is
//! derived from that ledger on read and never stored.

pub mod channels;
pub mod collections;
pub mod config;
pub mod db;
pub mod error;

#[cfg(test)]
pub(crate) mod testing;
