pub mod app;
pub mod archive;
pub mod catalog;
pub mod classifier;
pub mod config;
pub mod cutout;
pub mod domain;
pub mod error;
pub mod fetch;
pub mod filter;
pub mod forest;
pub mod output;
pub mod pool;
pub mod store;
pub mod tui;
