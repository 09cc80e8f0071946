pub mod config;
pub mod dataset;
pub mod embed;
pub mod error;
pub mod external;
pub mod fingerprint;
pub mod metrics;
pub mod report;
pub mod search;
pub mod store;
pub mod syntax;
pub mod vectorize;
