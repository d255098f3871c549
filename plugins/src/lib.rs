pub mod accounts;
pub mod analyzer;
pub mod factory;
pub mod handlers;
mod http;
pub mod persistence;
pub mod queue;
pub mod services;
pub mod source;
pub mod strategies;
pub mod upstream;
