//! Subscription feeds: link decoding and registry reconciliation.

pub mod importer;
pub mod parser;

pub use importer::{RefreshReport, SubscriptionImporter};
pub use parser::{parse_link, FetchOptions, LinkParser};
