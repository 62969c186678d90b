//! JWT 会话查询
//!
//! 令牌由 CRUD 层签发（HS256），声明 `{sub, username, role, exp}`。
//! 这里只做校验，把声明转换为 [`Session`] 交给枢纽判断过期与封禁。

use application::{ApplicationError, AuthError, SessionLookup};
use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use chrono::{TimeZone, Utc};
use config::JwtConfig;
use domain::{Identity, Role, Session, UserId};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// JWT Claims 结构
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub role: Role,
    pub exp: i64, // 过期时间 (Unix timestamp)
}

/// 基于共享密钥的会话查询
#[derive(Clone)]
pub struct JwtSessionLookup {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtSessionLookup {
    pub fn new(config: &JwtConfig) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(config.secret.as_ref()),
            decoding_key: DecodingKey::from_secret(config.secret.as_ref()),
        }
    }

    /// 签发令牌（CRUD 层与测试使用）
    pub fn issue(&self, claims: &Claims) -> Result<String, ApplicationError> {
        encode(&Header::default(), claims, &self.encoding_key)
            .map_err(|err| ApplicationError::infrastructure(format!("token generation failed: {err}")))
    }

    /// 校验签名并解析声明
    ///
    /// 过期由枢纽统一判断，这里关闭 `exp` 校验，只要求字段存在。
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let mut validation = Validation::default();
        validation.validate_exp = false;
        validation.set_required_spec_claims(&["exp", "sub"]);
        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|err| {
                tracing::debug!(error = %err, "session token rejected");
                match err.kind() {
                    ErrorKind::ExpiredSignature => AuthError::Expired,
                    _ => AuthError::InvalidToken,
                }
            })
    }
}

#[async_trait]
impl SessionLookup for JwtSessionLookup {
    async fn lookup(&self, token: &str) -> Result<Option<Session>, ApplicationError> {
        let claims = match self.verify(token) {
            Ok(claims) => claims,
            Err(AuthError::InvalidToken) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let Some(expires_at) = Utc.timestamp_opt(claims.exp, 0).single() else {
            return Ok(None);
        };
        Ok(Some(Session {
            identity: Identity {
                user_id: UserId::from(claims.sub),
                username: claims.username,
                role: claims.role,
            },
            expires_at,
        }))
    }
}

/// 从 `Authorization: Bearer` 头取令牌
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}
