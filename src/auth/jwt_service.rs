use crate::auth::models::{timestamp_to_datetime, ClientType, Identity, TokenClaims, TokenType};
use crate::config::{TokenConfig, MIN_SECRET_LEN};
use crate::error::{AuthError, Result};
use chrono::{Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use uuid::Uuid;

/// JWT 签发和解析服务 (HS512 对称签名)
///
/// 无状态：只负责签名与 claims 编解码，令牌是否仍然有效由会话存储决定。
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    audience: Vec<String>,
    leeway_secs: u64,
}

impl JwtService {
    /// 创建 JWT 服务，密钥短于 64 字节时直接失败
    pub fn new(config: &TokenConfig) -> Result<Self> {
        if config.secret.len() < MIN_SECRET_LEN {
            return Err(AuthError::Configuration(format!(
                "signing secret must be at least {} bytes, got {}",
                MIN_SECRET_LEN,
                config.secret.len()
            )));
        }
        if config.audience.is_empty() {
            return Err(AuthError::Configuration(
                "audience must not be empty".to_string(),
            ));
        }

        Ok(Self {
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            leeway_secs: config.clock_skew_secs,
        })
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// 签发令牌
    pub fn generate(
        &self,
        identity: &Identity,
        token_type: TokenType,
        client_type: &ClientType,
        device_id: Option<&str>,
        ttl: Duration,
    ) -> Result<String> {
        let now = Utc::now().timestamp();

        let claims = TokenClaims {
            sub: identity.username.clone(),
            user_id: identity.user_id,
            display_name: identity.display_name.clone(),
            roles: identity.roles.clone(),
            permissions: identity.permissions.clone(),
            token_type,
            client_type: client_type.clone(),
            device_id: device_id.map(str::to_string),
            email: identity.email.clone(),
            mobile: identity.mobile.clone(),
            iss: self.issuer.clone(),
            iat: now,
            exp: now + ttl.num_seconds(),
            aud: self.audience.clone(),
            jti: Uuid::new_v4().to_string(),
        };

        let header = Header::new(Algorithm::HS512);
        let token = encode(&header, &claims, &self.encoding_key)
            .map_err(|e| AuthError::Internal(format!("JWT 签发失败: {}", e)))?;

        Ok(token)
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::HS512);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&self.audience);
        validation.leeway = self.leeway_secs;
        validation
    }

    /// 解析并校验令牌
    ///
    /// 格式错误、签名不匹配、签发者/受众不符 → InvalidToken；过期 → TokenExpired。
    pub fn parse(&self, token: &str) -> Result<TokenClaims> {
        match decode::<TokenClaims>(token, &self.decoding_key, &self.validation()) {
            Ok(data) => Ok(data.claims),
            Err(e) => match e.kind() {
                ErrorKind::ExpiredSignature => Err(self.expired_error(token)),
                ErrorKind::InvalidSignature => {
                    Err(AuthError::invalid_token("jwt", "signature mismatch"))
                }
                ErrorKind::InvalidIssuer => Err(AuthError::invalid_token("jwt", "unknown issuer")),
                ErrorKind::InvalidAudience => {
                    Err(AuthError::invalid_token("jwt", "unknown audience"))
                }
                ErrorKind::InvalidAlgorithm => {
                    Err(AuthError::invalid_token("jwt", "unexpected algorithm"))
                }
                ErrorKind::MissingRequiredClaim(claim) => Err(AuthError::invalid_token(
                    "jwt",
                    format!("missing claim: {}", claim),
                )),
                _ => Err(AuthError::invalid_token("jwt", "malformed token")),
            },
        }
    }

    /// 签名已验证但过期时，再次解码（跳过 exp 校验）取出令牌类型和过期时间
    fn expired_error(&self, token: &str) -> AuthError {
        let mut validation = self.validation();
        validation.validate_exp = false;

        match decode::<TokenClaims>(token, &self.decoding_key, &validation) {
            Ok(data) => AuthError::token_expired(
                data.claims.token_type.as_str(),
                timestamp_to_datetime(data.claims.exp),
            ),
            Err(_) => AuthError::token_expired("jwt", Utc::now()),
        }
    }

    /// 校验签名、签发者和受众，但不校验过期时间（用于查询已过期令牌的详情）
    pub fn parse_allow_expired(&self, token: &str) -> Result<TokenClaims> {
        let mut validation = self.validation();
        validation.validate_exp = false;

        decode::<TokenClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature => AuthError::invalid_token("jwt", "signature mismatch"),
                _ => AuthError::invalid_token("jwt", "malformed token"),
            })
    }

    /// 解析并要求指定的令牌类型
    pub fn parse_typed(&self, token: &str, expected: TokenType) -> Result<TokenClaims> {
        let claims = self.parse(token)?;
        if claims.token_type != expected {
            return Err(AuthError::invalid_token(
                expected.as_str(),
                format!("expected {} token, got {}", expected, claims.token_type),
            ));
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TokenConfig {
        TokenConfig {
            secret: "s".repeat(64),
            ..TokenConfig::default()
        }
    }

    fn alice() -> Identity {
        Identity::new(42, "alice")
            .with_role("USER")
            .with_permission("profile:read")
    }

    #[test]
    fn test_jwt_generate_and_parse() {
        let jwt_service = JwtService::new(&config()).unwrap();

        let token = jwt_service
            .generate(
                &alice(),
                TokenType::Access,
                &ClientType::App,
                Some("dev-1"),
                Duration::hours(1),
            )
            .unwrap();
        assert!(!token.is_empty());

        let claims = jwt_service.parse(&token).unwrap();
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.user_id, 42);
        assert_eq!(claims.token_type, TokenType::Access);
        assert_eq!(claims.client_type, ClientType::App);
        assert_eq!(claims.device_id.as_deref(), Some("dev-1"));
        assert!(claims.roles.contains("USER"));
        assert_eq!(claims.exp - claims.iat, 3600);
        assert_eq!(claims.identity(), alice());
    }

    #[test]
    fn test_short_secret_rejected() {
        let mut config = config();
        config.secret = "s".repeat(63);
        assert!(matches!(
            JwtService::new(&config),
            Err(AuthError::Configuration(_))
        ));
    }

    #[test]
    fn test_tokens_are_unique() {
        let jwt_service = JwtService::new(&config()).unwrap();
        let a = jwt_service
            .generate(&alice(), TokenType::Access, &ClientType::Web, None, Duration::hours(1))
            .unwrap();
        let b = jwt_service
            .generate(&alice(), TokenType::Access, &ClientType::Web, None, Duration::hours(1))
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_expired_token() {
        let jwt_service = JwtService::new(&config()).unwrap();
        let token = jwt_service
            .generate(
                &alice(),
                TokenType::Refresh,
                &ClientType::Web,
                None,
                Duration::seconds(-10),
            )
            .unwrap();

        match jwt_service.parse(&token) {
            Err(AuthError::TokenExpired { token_type, .. }) => assert_eq!(token_type, "refresh"),
            other => panic!("expected TokenExpired, got {:?}", other),
        }

        let claims = jwt_service.parse_allow_expired(&token).unwrap();
        assert!(claims.is_expired());
    }

    #[test]
    fn test_signature_mismatch() {
        let jwt_service = JwtService::new(&config()).unwrap();
        let mut other = config();
        other.secret = "x".repeat(64);
        let other_service = JwtService::new(&other).unwrap();

        let token = other_service
            .generate(&alice(), TokenType::Access, &ClientType::Web, None, Duration::hours(1))
            .unwrap();
        assert!(matches!(
            jwt_service.parse(&token),
            Err(AuthError::InvalidToken { .. })
        ));
    }

    #[test]
    fn test_unknown_issuer_and_malformed() {
        let jwt_service = JwtService::new(&config()).unwrap();
        let mut other = config();
        other.issuer = "someone-else".to_string();
        let other_service = JwtService::new(&other).unwrap();

        let token = other_service
            .generate(&alice(), TokenType::Access, &ClientType::Web, None, Duration::hours(1))
            .unwrap();
        assert!(matches!(
            jwt_service.parse(&token),
            Err(AuthError::InvalidToken { .. })
        ));
        assert!(matches!(
            jwt_service.parse("invalid.token.here"),
            Err(AuthError::InvalidToken { .. })
        ));
    }

    #[test]
    fn test_parse_typed_rejects_wrong_kind() {
        let jwt_service = JwtService::new(&config()).unwrap();
        let token = jwt_service
            .generate(&alice(), TokenType::Access, &ClientType::Web, None, Duration::hours(1))
            .unwrap();
        assert!(jwt_service.parse_typed(&token, TokenType::Access).is_ok());
        assert!(matches!(
            jwt_service.parse_typed(&token, TokenType::Refresh),
            Err(AuthError::InvalidToken { .. })
        ));
    }
}
