pub mod config;
pub mod extension;
pub mod instance;
pub mod patcher;
pub mod process_monitor;
pub mod status;
pub mod supervisor;
pub mod utils;
