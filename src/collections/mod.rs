//! Debt-collection event correlation: tokens, ledger, ingestion, status, dispatch.

pub mod audit;
pub mod currency;
pub mod dispatch;
pub mod ingest;
pub mod ledger;
pub mod reconcile;
pub mod retry;
pub mod status;
pub mod tokens;

pub use dispatch::{Dispatcher, OutboundContent};
pub use ingest::WebhookIngestor;
pub use ledger::EventLedger;
pub use status::{DebtorStatus, StatusService};
pub use tokens::{TokenSealer, TokenService};
