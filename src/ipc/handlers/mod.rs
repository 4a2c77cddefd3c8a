pub mod console;
pub mod files;
pub mod server;
