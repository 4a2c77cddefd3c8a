pub mod config;
pub mod engine;
pub mod files;
pub mod hub;
pub mod instance;
pub mod ipc;
pub mod supervisor;
pub mod utils;
