pub mod auth;
pub mod config;
pub mod engine;
pub mod gateway;
pub mod limits;
pub mod model;
pub mod money;
pub mod notify;
pub mod observability;
pub mod settlement;
pub mod sql;
pub mod tenant;
pub mod tls;
pub mod wal;
pub mod wire;
