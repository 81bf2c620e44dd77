// Library root: re-exports all modules so integration tests and the binary
// share one public API.

pub mod broadcast;
pub mod config;
pub mod connection;
pub mod gateway;
pub mod http;
pub mod ws_server;
