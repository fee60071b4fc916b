//! Authentication module for Stowage

pub mod jwt;
pub mod middleware;
pub mod password;

pub use jwt::{Claims, IssuedToken, JwtManager};
pub use middleware::{
    require_auth, require_billing_manager, AuthError, AuthState, AuthUser, AUTH_COOKIE,
    BILLING_MANAGER_ROLES, ROLE_ADMIN, ROLE_MEMBER, ROLE_OWNER,
};
pub use password::{hash_password, validate_password_strength, verify_password, PasswordError};
