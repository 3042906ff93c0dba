//! Core runtime: the registry of backend servers, their supervisor, one
//! circuit breaker per protected dependency, the response cache, the
//! JSON-RPC proxy and the prompt enhancement middleware.
//!
//! Control flow for one call: enhancement (optional rewrite) → [`Proxy`]
//! → the supervisor's live connection, gated by the server's breaker.

pub mod breaker;
pub mod cache;
pub mod enhance;
pub mod error;
pub mod proxy;
pub mod registry;
pub mod supervisor;

pub use breaker::{Admission, BreakerRegistry, BreakerSnapshot, BreakerStatus, CircuitBreaker};
pub use cache::{CacheStats, ResponseCache};
pub use enhance::{EnhanceOutcome, EnhanceStats, Enhancer};
pub use error::GatewayError;
pub use proxy::{ForwardOptions, Proxy};
pub use registry::{RegistryDiff, ServerRegistry, ServerState, ServerStatus, ServerView};
pub use supervisor::{HealthReport, Supervisor};
