pub mod api;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod worker;
