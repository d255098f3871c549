pub mod admission;
pub mod api;
pub mod config;
pub mod context;
pub mod detector;
pub mod error;
pub mod executor;
pub mod health;
pub mod pipeline;
