pub mod aggregate;
pub mod config;
pub mod downtime;
pub mod period;
pub mod reconcile;
pub mod source;
pub mod store;
pub mod tracker;
