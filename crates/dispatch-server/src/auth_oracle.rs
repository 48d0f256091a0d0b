//! Authorization oracle stub.
//!
//! Spec scopes real auth out as an external collaborator ("role assigned by
//! an external authorization oracle... immutable except by admin"). This
//! module is the narrowest thing that makes the REST surface exercisable
//! end-to-end: an in-memory identity→role map plus JWT issuing, using
//! `jsonwebtoken` the way the teacher already pulls it in for its own OAuth
//! flow. A real deployment would swap this for an actual identity provider
//! without the rest of the server noticing, since callers only ever see
//! `Claims`.

use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use dispatch_core::UserRole;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

const ACCESS_TOKEN_TTL_S: u64 = 3600;
const REFRESH_TOKEN_TTL_S: u64 = 3600 * 24 * 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Access,
    Refresh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: UserRole,
    pub token_type: TokenType,
    pub exp: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid or expired token")]
    InvalidToken,
    #[error("identity already registered with a different role")]
    RoleConflict,
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_secs()
}

/// Issues and records identity→role bindings. `role_for` is consulted on
/// login; once an identity has a role, only a caller already holding
/// `UserRole::Admin` can change it (enforced by callers, not this store).
pub struct AuthOracle {
    secret: String,
    identities: DashMap<String, UserRole>,
}

impl AuthOracle {
    pub fn new(secret: String, admin_identity: &str) -> Self {
        let identities = DashMap::new();
        identities.insert(admin_identity.to_string(), UserRole::Admin);
        Self { secret, identities }
    }

    pub fn role_for(&self, identity: &str) -> Option<UserRole> {
        self.identities.get(identity).map(|r| *r)
    }

    /// Registers `identity` with `role` if unseen, or returns the existing
    /// role. `acting_role` must be `Admin` to overwrite an existing binding.
    pub fn upsert_identity(&self, identity: &str, role: UserRole, acting_role: Option<UserRole>) -> Result<UserRole, AuthError> {
        if let Some(existing) = self.identities.get(identity) {
            if *existing == role {
                return Ok(*existing);
            }
            if acting_role != Some(UserRole::Admin) {
                return Err(AuthError::RoleConflict);
            }
        }
        self.identities.insert(identity.to_string(), role);
        Ok(role)
    }

    pub fn issue_tokens(&self, identity: &str, role: UserRole) -> (String, String) {
        let access = self.encode(identity, role, TokenType::Access, ACCESS_TOKEN_TTL_S);
        let refresh = self.encode(identity, role, TokenType::Refresh, REFRESH_TOKEN_TTL_S);
        (access, refresh)
    }

    fn encode(&self, identity: &str, role: UserRole, token_type: TokenType, ttl_s: u64) -> String {
        let claims = Claims { sub: identity.to_string(), role, token_type, exp: now_unix() + ttl_s };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(self.secret.as_bytes())).expect("jwt encoding never fails for well-formed claims")
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &DecodingKey::from_secret(self.secret.as_bytes()), &Validation::default())
            .map(|data| data.claims)
            .map_err(|_| AuthError::InvalidToken)
    }

    pub fn refresh(&self, refresh_token: &str) -> Result<(String, String), AuthError> {
        let claims = self.verify(refresh_token)?;
        if claims.token_type != TokenType::Refresh {
            return Err(AuthError::InvalidToken);
        }
        Ok(self.issue_tokens(&claims.sub, claims.role))
    }
}
