pub mod cache;
pub mod clipboard;
pub mod config;
pub mod contract;
pub mod logging;
pub mod menu;
pub mod model;
pub mod orchestrator;
pub mod runtime;
pub mod search;
pub mod settings;
pub mod supervisor;
pub mod transport;
pub mod vault_client;
