//! Bearer token validation and refresh.
//!
//! Access tokens are HS256 JWTs carrying the principal (user id, email,
//! role). Refresh tokens are the same shape with `typ = "refresh"` and a
//! longer lifetime; they can only be exchanged for a fresh access token,
//! never presented as one. The verifier keeps no session state — the refresh
//! manager owns the per-connection rotation schedule.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

const DEFAULT_ACCESS_TTL_SECS: i64 = 15 * 60;
const DEFAULT_REFRESH_TTL_SECS: i64 = 7 * 24 * 60 * 60;

// ─── Types ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Operator,
    Viewer,
}

impl Role {
    /// Emergency stop and agent control require more than read access.
    pub fn can_control(self) -> bool {
        matches!(self, Role::Admin | Role::Operator)
    }
}

/// Authenticated identity attached to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: String,
    pub email: String,
    pub role: Role,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid token")]
    InvalidToken,
    #[error("token expired")]
    Expired,
    #[error("wrong token type for this operation")]
    WrongTokenType,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    email: String,
    role: Role,
    /// `"access"` or `"refresh"`.
    typ: String,
    exp: i64,
    iat: i64,
}

// ─── Verifier ─────────────────────────────────────────────────────────────────

pub struct AuthVerifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl AuthVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::default();
        validation.leeway = 0;
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            access_ttl: Duration::seconds(DEFAULT_ACCESS_TTL_SECS),
            refresh_ttl: Duration::seconds(DEFAULT_REFRESH_TTL_SECS),
        }
    }

    /// Validate an access token. Returns the principal and the expiry
    /// instant (the refresh manager schedules rotation from it).
    pub fn validate(&self, token: &str) -> Result<(Principal, DateTime<Utc>), AuthError> {
        let claims = self.decode(token)?;
        if claims.typ != "access" {
            return Err(AuthError::WrongTokenType);
        }
        let expires_at = DateTime::from_timestamp(claims.exp, 0).ok_or(AuthError::InvalidToken)?;
        Ok((
            Principal {
                user_id: claims.sub,
                email: claims.email,
                role: claims.role,
            },
            expires_at,
        ))
    }

    /// Exchange a refresh token for a new access token.
    /// Returns `(access_token, expires_in_secs)`.
    pub fn refresh(&self, refresh_token: &str) -> Result<(String, u64), AuthError> {
        let claims = self.decode(refresh_token)?;
        if claims.typ != "refresh" {
            return Err(AuthError::WrongTokenType);
        }
        let principal = Principal {
            user_id: claims.sub,
            email: claims.email,
            role: claims.role,
        };
        let (token, _) = self.issue_access(&principal);
        Ok((token, self.access_ttl.num_seconds() as u64))
    }

    /// Mint an access token for `principal`. Returns the token and its expiry.
    pub fn issue_access(&self, principal: &Principal) -> (String, DateTime<Utc>) {
        self.issue(principal, "access", self.access_ttl)
    }

    /// Mint a refresh token for `principal`.
    pub fn issue_refresh(&self, principal: &Principal) -> String {
        self.issue(principal, "refresh", self.refresh_ttl).0
    }

    fn issue(&self, principal: &Principal, typ: &str, ttl: Duration) -> (String, DateTime<Utc>) {
        let now = Utc::now();
        let expires_at = now + ttl;
        let claims = Claims {
            sub: principal.user_id.clone(),
            email: principal.email.clone(),
            role: principal.role,
            typ: typ.to_string(),
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
        };
        let token = encode(&Header::default(), &claims, &self.encoding)
            .unwrap_or_default();
        (token, expires_at)
    }

    fn decode(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidToken,
            })
    }
}

// ─── Secret management ────────────────────────────────────────────────────────

/// Return the JWT signing secret for this server instance.
///
/// On first call, generates a random 64-character hex secret and writes it to
/// `{data_dir}/jwt_secret` with user-only read/write permissions (mode 0600
/// on Unix). On subsequent calls, reads and returns the existing secret.
///
/// The secret file must be kept private — anyone holding it can mint tokens
/// for any principal.
pub fn get_or_create_secret(data_dir: &Path) -> Result<String> {
    let path = data_dir.join("jwt_secret");

    if path.exists() {
        let secret = std::fs::read_to_string(&path)?.trim().to_string();
        if !secret.is_empty() {
            return Ok(secret);
        }
    }

    // Two UUID v4s, hex without dashes = 64 chars.
    let secret = format!(
        "{}{}",
        Uuid::new_v4().to_string().replace('-', ""),
        Uuid::new_v4().to_string().replace('-', "")
    );

    std::fs::create_dir_all(data_dir)?;

    // Create the file with owner-only permissions from the start to eliminate
    // the TOCTOU window that would exist if we wrote first and chmod'd second.
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)?;
        f.write_all(secret.as_bytes())?;
    }
    #[cfg(not(unix))]
    std::fs::write(&path, &secret)?;

    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier() -> AuthVerifier {
        AuthVerifier::new("test-secret-test-secret-test-secret")
    }

    fn principal() -> Principal {
        Principal {
            user_id: "u-1".to_string(),
            email: "dev@example.com".to_string(),
            role: Role::Operator,
        }
    }

    #[test]
    fn issue_and_validate_round_trip() {
        let v = verifier();
        let (token, expires_at) = v.issue_access(&principal());
        let (p, exp) = v.validate(&token).expect("validate");
        assert_eq!(p, principal());
        assert_eq!(exp.timestamp(), expires_at.timestamp());
    }

    #[test]
    fn malformed_token_is_invalid() {
        let v = verifier();
        assert_eq!(v.validate("not-a-jwt").unwrap_err(), AuthError::InvalidToken);
        assert_eq!(
            v.validate("aaaa.bbbb.cccc").unwrap_err(),
            AuthError::InvalidToken
        );
    }

    #[test]
    fn refresh_token_rejected_as_access() {
        let v = verifier();
        let refresh = v.issue_refresh(&principal());
        assert_eq!(v.validate(&refresh).unwrap_err(), AuthError::WrongTokenType);
    }

    #[test]
    fn access_token_rejected_for_refresh() {
        let v = verifier();
        let (access, _) = v.issue_access(&principal());
        assert_eq!(v.refresh(&access).unwrap_err(), AuthError::WrongTokenType);
    }

    #[test]
    fn refresh_exchange_yields_valid_access() {
        let v = verifier();
        let refresh = v.issue_refresh(&principal());
        let (access, expires_in) = v.refresh(&refresh).expect("refresh");
        assert!(expires_in > 0);
        let (p, _) = v.validate(&access).expect("validate minted token");
        assert_eq!(p.user_id, "u-1");
    }

    #[test]
    fn wrong_secret_fails() {
        let v = verifier();
        let (token, _) = v.issue_access(&principal());
        let other = AuthVerifier::new("different-secret-different-secret");
        assert_eq!(other.validate(&token).unwrap_err(), AuthError::InvalidToken);
    }

    #[test]
    fn secret_is_created_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = get_or_create_secret(dir.path()).expect("create");
        let b = get_or_create_secret(dir.path()).expect("read back");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }
}
