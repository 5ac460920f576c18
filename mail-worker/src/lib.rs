pub mod config;
pub mod directory;
pub mod error;
pub mod message;
pub mod reply;
pub mod transport;
pub mod worker;
