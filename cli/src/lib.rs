//! harvest-cli library: exposes the command wiring for unit tests.

pub mod app;
pub mod commands;
