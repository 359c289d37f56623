pub mod api;
pub mod app;
pub mod autoconfig;
pub mod catalog;
pub mod channel;
pub mod config;
pub mod env_flags;
pub mod model;
pub mod registry;
pub mod tracker;
