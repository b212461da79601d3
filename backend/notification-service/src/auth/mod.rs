/// Connection-time authentication
///
/// Tokens are HS256 JWTs issued by the platform's auth routes. They are checked
/// once when a socket is opened (and on every admin/notification HTTP call);
/// messages on an established socket are never re-verified.
use actix_web::{dev::Payload, web, FromRequest, HttpRequest};
use chrono::Utc;
use futures::future::{ready, Ready};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::error::AppError;
use crate::websocket::RealtimeService;

/// Close code sent when the upgrade request carried no token
pub const CLOSE_MISSING_TOKEN: u16 = 4001;
/// Close code for a bad signature or an unusable payload
pub const CLOSE_INVALID_TOKEN: u16 = 4002;
/// Close code for a well-formed token past its expiry; clients should re-login
pub const CLOSE_TOKEN_EXPIRED: u16 = 4003;

const VALIDATION_LEEWAY_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Student,
    Teacher,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "STUDENT",
            Role::Teacher => "TEACHER",
            Role::Admin => "ADMIN",
        }
    }

    /// Teachers and admins may push notifications to other users
    pub fn can_publish(&self) -> bool {
        matches!(self, Role::Teacher | Role::Admin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "STUDENT" => Ok(Role::Student),
            "TEACHER" | "INSTRUCTOR" => Ok(Role::Teacher),
            "ADMIN" => Ok(Role::Admin),
            other => Err(AuthError::InvalidToken(format!("unknown role {}", other))),
        }
    }
}

/// Verified identity attached to a connection for its whole lifetime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    pub email: String,
    pub role: Role,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, email: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            email: email.into(),
            role,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id; tokens minted by the legacy auth route call it `id`
    #[serde(alias = "id")]
    pub sub: String,
    #[serde(default)]
    pub email: String,
    pub role: String,
    pub exp: i64,
    #[serde(default)]
    pub iat: i64,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("authentication token missing")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token expired")]
    Expired,
}

impl AuthError {
    pub fn close_code(&self) -> u16 {
        match self {
            AuthError::MissingToken => CLOSE_MISSING_TOKEN,
            AuthError::InvalidToken(_) => CLOSE_INVALID_TOKEN,
            AuthError::Expired => CLOSE_TOKEN_EXPIRED,
        }
    }

    pub fn close_reason(&self) -> &'static str {
        match self {
            AuthError::MissingToken => "Authentication required",
            AuthError::InvalidToken(_) => "Invalid token",
            AuthError::Expired => "Token expired",
        }
    }

    /// Metric label
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::MissingToken => "missing",
            AuthError::InvalidToken(_) => "invalid",
            AuthError::Expired => "expired",
        }
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        AppError::Unauthorized(err.close_reason().to_string())
    }
}

pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Treats an absent or blank token as missing before consulting the verifier
pub fn authenticate(verifier: &dyn TokenVerifier, token: Option<&str>) -> Result<Identity, AuthError> {
    match token.map(str::trim) {
        None | Some("") => Err(AuthError::MissingToken),
        Some(token) => verifier.verify(token),
    }
}

/// Shared-secret JWT verifier
pub struct JwtVerifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = VALIDATION_LEEWAY_SECS;
        validation.set_required_spec_claims(&["exp"]);

        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Mint a token for `identity`; used by tooling and tests
    pub fn issue_token(
        &self,
        identity: &Identity,
        expires_in: chrono::Duration,
    ) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = Claims {
            sub: identity.user_id.clone(),
            email: identity.email.clone(),
            role: identity.role.as_str().to_string(),
            exp: (now + expires_in).timestamp(),
            iat: now.timestamp(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;

        let claims = data.claims;
        if claims.sub.trim().is_empty() {
            return Err(AuthError::InvalidToken("empty subject".to_string()));
        }

        Ok(Identity {
            user_id: claims.sub,
            email: claims.email,
            role: claims.role.parse()?,
        })
    }
}

/// Extract `Authorization: Bearer <token>`
pub fn bearer_token(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get(actix_web::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

/// Identity of the caller of an HTTP route, verified with the service's token verifier
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub Identity);

impl AuthenticatedUser {
    pub fn require_publisher(&self) -> Result<(), AppError> {
        if self.0.role.can_publish() {
            Ok(())
        } else {
            Err(AppError::Forbidden)
        }
    }

    pub fn require_admin(&self) -> Result<(), AppError> {
        if self.0.role == Role::Admin {
            Ok(())
        } else {
            Err(AppError::Forbidden)
        }
    }
}

impl FromRequest for AuthenticatedUser {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let Some(service) = req.app_data::<web::Data<RealtimeService>>() else {
            tracing::error!("RealtimeService missing from app data");
            return ready(Err(AppError::Internal));
        };

        let token = bearer_token(req);
        let result = service
            .authenticate(token.as_deref())
            .map(AuthenticatedUser)
            .map_err(|e| {
                tracing::warn!(reason = e.kind(), "HTTP authentication failed");
                AppError::from(e)
            });
        ready(result)
    }
}
