//! Runtime core of the Toto framework.
//!
//! This crate carries the session and account stores, the bounded task
//! queue, the event bus, the worker dispatch fabric, and the method
//! registry that the request pipeline in `toto-client-api` drives.

pub mod config;
pub mod context;
pub mod daemon;
pub mod events;
pub mod methods;
pub mod secret;
pub mod session;
pub mod tasks;
pub mod worker;

pub use config::TotoConfig;
pub use context::ServiceContext;
