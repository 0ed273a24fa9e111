pub mod api;
pub mod auth;
pub mod benchmark;
pub mod config;
pub mod error;
pub mod model;
pub mod scheduler;
pub mod server;
pub mod streaming;

pub use auth::{KeyMinter, KeyStore, KeyVerifier, MemoryKeyStore};
pub use benchmark::{BenchmarkProfile, BenchmarkReport, RecommendedConfig};
pub use config::{AppConfig, RuntimeBackend};
pub use error::ServiceError;
pub use model::{GenerationRequest, GenerationResult, ModelRuntime, ScriptedRuntime};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use server::{AppState, build_router};
pub use streaming::{ResponseStream, StreamEvent};
