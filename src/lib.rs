pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod infra;
pub mod logging;

pub use auth::{
    BlockingTokenManager, CleanupReport, ClientType, Identity, TokenDetails, TokenManager,
    TokenPair, TokenStatus, TokenType, ValidationResult,
};
pub use config::AuthConfig;
pub use error::{AuthError, ErrorCode, ErrorInfo, Result};
pub use infra::{KvBackend, MemoryBackend, RedisClient};
