pub mod backoff;
pub mod claim;
pub mod config;
pub mod connector;
pub mod consumer;
pub mod error;
pub mod group;
pub mod kafka_group;
pub mod lifecycle;
pub mod scram;
