pub mod batch;
pub mod config;
pub mod migrate;
pub mod renumber;
pub mod rewrite;
pub mod runtime;
pub mod services;
pub mod store;
