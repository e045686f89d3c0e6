pub mod config;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod observability;
pub mod origin;
pub mod server;

pub use config::{AppConfig, LoggingConfig, OriginConfig, ServerConfig, WarmupConfig};
pub use observability::init_tracing;
pub use origin::{OriginClient, OriginError, OriginResponse};
pub use server::{AppState, ServerBuilder, TiercacheServer, build_app};
