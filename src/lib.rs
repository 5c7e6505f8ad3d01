pub mod activity;
pub mod api;
pub mod authz;
pub mod client;
pub mod config;
pub mod protocol;
pub mod pty;
pub mod reaper;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod terminal;
