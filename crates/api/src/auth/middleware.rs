//! Authentication middleware for Axum

use axum::{
    extract::{Request, State},
    http::{
        header::{AUTHORIZATION, COOKIE},
        StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use uuid::Uuid;

use super::jwt::JwtManager;

/// Cookie set by the web client after signup
pub const AUTH_COOKIE: &str = "stowage_auth_token";

/// Account holder role
pub const ROLE_OWNER: &str = "owner";
/// Support staff acting on an account
pub const ROLE_ADMIN: &str = "admin";
/// Read-only collaborator
pub const ROLE_MEMBER: &str = "member";

/// Roles allowed to change billing
pub const BILLING_MANAGER_ROLES: &[&str] = &[ROLE_OWNER, ROLE_ADMIN];

/// Authenticated caller extracted from a bearer token
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub account_id: Uuid,
    pub role: String,
    pub email: String,
}

impl AuthUser {
    pub fn can_manage_billing(&self) -> bool {
        BILLING_MANAGER_ROLES.contains(&self.role.as_str())
    }
}

/// State needed for authentication
#[derive(Clone)]
pub struct AuthState {
    pub jwt_manager: JwtManager,
}

/// Bearer token from the HttpOnly auth cookie
fn extract_token_from_cookie(request: &Request) -> Option<String> {
    request
        .headers()
        .get(COOKIE)
        .and_then(|h| h.to_str().ok())
        .and_then(|cookies| {
            cookies
                .split(';')
                .map(str::trim)
                .find_map(|cookie| cookie.strip_prefix(AUTH_COOKIE)?.strip_prefix('='))
                .map(String::from)
        })
}

/// Extract bearer token from Authorization header or HttpOnly cookie
/// Prefers the Authorization header
fn extract_bearer_token(request: &Request) -> Option<String> {
    if let Some(header) = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
    {
        if let Some(token) = header.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }

    extract_token_from_cookie(request)
}

/// Middleware that requires a valid access token
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let auth_result = match extract_bearer_token(&request) {
        Some(token) => authenticate_jwt(&auth_state, &token),
        None => Err(AuthError::MissingAuth),
    };

    match auth_result {
        Ok(auth_user) => {
            tracing::debug!(
                path = %path,
                account_id = %auth_user.account_id,
                role = %auth_user.role,
                "require_auth: authentication successful"
            );
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %path, error = %err, "require_auth: authentication failed");
            err.into_response()
        }
    }
}

/// Middleware that requires an owner or admin. Runs after [`require_auth`].
pub async fn require_billing_manager(request: Request, next: Next) -> Response {
    let Some(auth_user) = request.extensions().get::<AuthUser>() else {
        return AuthError::MissingAuth.into_response();
    };

    if !auth_user.can_manage_billing() {
        tracing::warn!(
            path = %request.uri().path(),
            account_id = %auth_user.account_id,
            role = %auth_user.role,
            "Billing change refused for role"
        );
        return AuthError::InsufficientPermissions.into_response();
    }

    next.run(request).await
}

fn authenticate_jwt(auth_state: &AuthState, token: &str) -> Result<AuthUser, AuthError> {
    if token.is_empty() || token.split('.').count() != 3 {
        return Err(AuthError::InvalidAuthFormat);
    }

    let claims = auth_state.jwt_manager.validate_token(token).map_err(|e| {
        tracing::debug!(error = %e, "JWT validation failed");
        AuthError::InvalidToken
    })?;

    Ok(AuthUser {
        account_id: claims.sub,
        role: claims.role,
        email: claims.email,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid authentication format")]
    InvalidAuthFormat,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Insufficient permissions")]
    InsufficientPermissions,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingAuth => (StatusCode::UNAUTHORIZED, "Authentication required"),
            AuthError::InvalidAuthFormat => {
                (StatusCode::UNAUTHORIZED, "Invalid authentication format")
            }
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid or expired token"),
            AuthError::InsufficientPermissions => {
                (StatusCode::FORBIDDEN, "Insufficient permissions")
            }
        };

        let body = Json(json!({
            "status": "error",
            "message": message,
        }));

        (status, body).into_response()
    }
}
