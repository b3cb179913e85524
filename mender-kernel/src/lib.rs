//! Mender kernel: supervises worker processes over WebSocket channels,
//! publishes their liveness and repairs failing workers one at a time.

pub mod backup;
pub mod config;
pub mod failures;
pub mod fixer;
pub mod health;
pub mod heartbeat;
pub mod http;
pub mod knowledge;
pub mod logline;
pub mod models;
pub mod registry;
pub mod remediation;
pub mod server;
pub mod state;
pub mod ws;

pub use config::KernelConfig;
pub use fixer::{CommandFixer, FixRequest, Fixer, FixerError, UnconfiguredFixer};
pub use models::HealthReport;
pub use server::{start, RunningKernel};
