pub mod broker;
pub mod config;
pub mod control;
pub mod dispatch;
pub mod http;
pub mod notify;
pub mod registry;
pub mod state;
pub mod version;
