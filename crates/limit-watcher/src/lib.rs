//! Limit watcher binary support: configuration and the HTTP probe API

pub mod api;
pub mod config;
