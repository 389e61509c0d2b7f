// 认证模块 - 提供令牌签发、验证、轮换、撤销与多设备会话管理

pub mod jwt_service;
pub mod models;
pub mod token_issue_service;
pub mod token_manager;
pub mod token_refresh_service;
pub mod token_revocation;
pub mod token_verify_service;

// 重新导出主要类型
pub use jwt_service::JwtService;
pub use models::{
    mask_token, CleanupReport, ClientType, Identity, SessionRecord, TokenClaims, TokenDetails,
    TokenPair, TokenStatus, TokenType, ValidationResult, ROLE_ADMIN, ROLE_GUEST,
};
pub use token_issue_service::TokenIssueService;
pub use token_manager::{BlockingTokenManager, TokenManager};
pub use token_refresh_service::{ReusePolicy, TokenRefreshService};
pub use token_revocation::TokenRevocationService;
pub use token_verify_service::TokenVerifyService;
