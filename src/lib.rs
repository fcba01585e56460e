pub mod auth;
pub mod backup;
pub mod config;
pub mod credentials;
pub mod error;
pub mod executor;
pub mod models;
pub mod notify;
pub mod orchestrator;
pub mod remote;
pub mod routes;
pub mod scheduler;
pub mod sheet;
pub mod state;
pub mod transfer;
pub mod utils;

pub use orchestrator::{Orchestrator, RemoteServices};
pub use scheduler::{JobKind, JobRun, Scheduler};
