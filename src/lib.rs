pub mod config;
pub mod environment;
#[cfg(unix)]
pub mod lock;
pub mod supervisor;
pub mod utils;
