pub mod config;
pub mod health;
pub mod ipc;
pub mod message;
pub mod paths;
pub mod text;
