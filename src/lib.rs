pub mod agent;
pub mod auth;
pub mod cache;
pub mod chain;
pub mod config;
pub mod error;
pub mod geo;
pub mod hub;
pub mod messages;
pub mod metrics;
pub mod registry;
pub mod router;
pub mod stats;

// Re-export commonly used types for easier testing
pub use crate::cache::{classify_method, CachePolicy, RequestLog, ResponseCache};
pub use crate::chain::{OnChainInfo, RegistryVerifier, StaticVerifier};
pub use crate::error::RelayError;
pub use crate::messages::WireMessage;
pub use crate::registry::{ConnectedNode, ConnectionRegistry, RegistrationState};
pub use crate::router::{RoutedResponse, Router};
pub use crate::stats::{GlobalStats, SessionStats, StatsService, WalletStats};
