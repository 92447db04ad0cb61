//! Jobs domain state and bearer-token authentication
//!
//! Token issuance lives upstream; this layer only verifies HS256 bearer
//! tokens against the shared secret and exposes the caller as an extractor.

use std::sync::Arc;

use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use storyreel_common::Error;

use crate::engine::scheduler::Scheduler;
use crate::hub::EventHub;
use crate::store::MemoryStore;

/// Verification-only auth configuration
#[derive(Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
}

/// Application state for the Jobs domain
#[derive(Clone)]
pub struct JobsState {
    pub store: Arc<MemoryStore>,
    pub hub: Arc<EventHub>,
    pub scheduler: Arc<Scheduler>,
    pub auth: AuthConfig,
}

impl FromRef<JobsState> for AuthConfig {
    fn from_ref(state: &JobsState) -> Self {
        state.auth.clone()
    }
}

/// Bearer token claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub email: String,
    pub exp: usize,
}

/// The authenticated caller, extracted from the Authorization header
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub user_id: Uuid,
    pub email: String,
}

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
    AuthConfig: FromRef<S>,
{
    type Rejection = Error;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        let auth = AuthConfig::from_ref(state);

        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .ok_or_else(|| Error::Authentication("missing Authorization header".to_string()))?
            .to_str()
            .map_err(|_| Error::Authentication("invalid Authorization header".to_string()))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| Error::Authentication("expected Bearer token".to_string()))?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;

        let token_data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(auth.jwt_secret.as_ref()),
            &validation,
        )
        .map_err(|e| {
            tracing::debug!(error = %e, "JWT validation failed");
            Error::Authentication("invalid token".to_string())
        })?;

        Ok(CurrentUser {
            user_id: token_data.claims.sub,
            email: token_data.claims.email,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-secret";

    fn mint(secret: &str, sub: Uuid) -> String {
        let claims = Claims {
            sub,
            email: "user@example.com".to_string(),
            exp: (chrono::Utc::now().timestamp() + 3600) as usize,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_ref())).unwrap()
    }

    fn parts_with_auth(value: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri("/v1/jobs");
        if let Some(v) = value {
            builder = builder.header("authorization", v);
        }
        builder.body(()).unwrap().into_parts().0
    }

    fn auth_config() -> AuthConfig {
        AuthConfig { jwt_secret: SECRET.to_string() }
    }

    #[tokio::test]
    async fn test_valid_bearer_token_is_accepted() {
        let user_id = Uuid::new_v4();
        let token = mint(SECRET, user_id);
        let mut parts = parts_with_auth(Some(&format!("Bearer {token}")));

        let user = CurrentUser::from_request_parts(&mut parts, &auth_config())
            .await
            .unwrap();
        assert_eq!(user.user_id, user_id);
        assert_eq!(user.email, "user@example.com");
    }

    #[tokio::test]
    async fn test_missing_header_is_rejected() {
        let mut parts = parts_with_auth(None);
        let err = CurrentUser::from_request_parts(&mut parts, &auth_config())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
    }

    #[tokio::test]
    async fn test_non_bearer_scheme_is_rejected() {
        let mut parts = parts_with_auth(Some("Basic abc123"));
        let err = CurrentUser::from_request_parts(&mut parts, &auth_config())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
    }

    #[tokio::test]
    async fn test_wrong_secret_is_rejected() {
        let token = mint("other-secret", Uuid::new_v4());
        let mut parts = parts_with_auth(Some(&format!("Bearer {token}")));
        let err = CurrentUser::from_request_parts(&mut parts, &auth_config())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
    }
}
