pub mod aggregator;
pub mod collector;
pub mod fetcher;
pub mod snapshot;
