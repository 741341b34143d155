// Core types and functionality for the toolgate proxy

pub mod build;
pub mod config;
pub mod patch;

pub use build::{BuildNumber, Workaround, WorkaroundSet};
pub use config::{ConfigError, ProxyConfig, ToolMode};
