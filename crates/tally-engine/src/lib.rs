pub mod aggregator;
pub mod forwarder;
pub mod mock;
pub mod paginator;
pub mod registry;
pub mod service;
pub mod tracker;

pub use service::{PollHistoryConfig, PollHistoryService};
