pub mod behavior;
pub mod clock;
pub mod config;
pub mod error;
pub mod guard;
pub mod metrics;
pub mod protocol;
pub mod query;
pub mod ratelimit;
pub mod server;
pub mod session;
pub mod store;
pub mod validator;
