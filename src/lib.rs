pub mod config;
pub mod geometry;
pub mod granularity;
pub mod job;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod queryable;
pub mod reaper;
pub mod repository;
pub mod store;
pub mod strategy;
pub mod wal;
