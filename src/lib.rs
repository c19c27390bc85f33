pub mod agent;
pub mod backup;
pub mod clock;
pub mod component;
pub mod config;
pub mod crypto;
pub mod error;
pub mod extensions;
pub mod health;
pub mod merge;
pub mod object;
pub mod observer;
pub mod retry;
pub mod router;
pub mod server;
pub mod shootstate;
pub mod store;

pub use error::Error;
