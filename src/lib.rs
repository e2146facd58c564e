#![forbid(unsafe_code)]

// sync-stress library - load-test coordinator driving durable simulated sync clients

pub mod auth;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod guard;
pub mod metrics;
pub mod run;
pub mod sync;
pub mod worker;
