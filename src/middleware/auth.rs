use axum::{extract::FromRequestParts, http::header};
use jsonwebtoken::{DecodingKey, Validation, decode};
use uuid::Uuid;

use crate::{
    dto::auth::Claims,
    entity::enums::Role,
    error::AppError,
    state::AppState,
};

#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub role: Role,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

pub fn ensure_role(user: &AuthUser, role: Role) -> Result<(), AppError> {
    if user.role != role {
        return Err(AppError::Forbidden);
    }
    Ok(())
}

pub fn ensure_admin(user: &AuthUser) -> Result<(), AppError> {
    ensure_role(user, Role::Admin)
}

/// Owner-or-admin rule for a resource owned by `owner_id`. A mismatch is
/// reported as `Unauthorized`; existence of the resource is not hidden.
pub fn ensure_owner_or_admin(user: &AuthUser, owner_id: Uuid, what: &str) -> Result<(), AppError> {
    if user.user_id == owner_id || user.is_admin() {
        return Ok(());
    }
    Err(AppError::Unauthorized(format!(
        "User {} is not authorized to access this {}",
        user.user_id, what
    )))
}

pub fn parse_role(raw: &str) -> Result<Role, AppError> {
    match raw {
        "admin" => Ok(Role::Admin),
        "user" => Ok(Role::User),
        _ => Err(AppError::Unauthorized("Invalid role in token".into())),
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;
    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(header::AUTHORIZATION)
            .ok_or_else(|| AppError::Unauthorized("Missing Authorization header".into()))?;

        let auth_str = auth_header
            .to_str()
            .map_err(|_| AppError::Unauthorized("Invalid Authorization header".into()))?;

        let token = auth_str
            .strip_prefix("Bearer ")
            .ok_or_else(|| AppError::Unauthorized("Invalid Authorization scheme".into()))?
            .trim();

        let decoded = decode::<Claims>(
            token,
            &DecodingKey::from_secret(state.auth.jwt_secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|_| AppError::Unauthorized("Invalid or expired token".into()))?;

        let user_id = Uuid::parse_str(&decoded.claims.sub)
            .map_err(|_| AppError::Unauthorized("Invalid user id in token".into()))?;

        Ok(AuthUser {
            user_id,
            role: parse_role(&decoded.claims.role)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(role: Role) -> AuthUser {
        AuthUser {
            user_id: Uuid::new_v4(),
            role,
        }
    }

    #[test]
    fn owner_or_admin_rule() {
        let owner = user(Role::User);
        let stranger = user(Role::User);
        let admin = user(Role::Admin);

        assert!(ensure_owner_or_admin(&owner, owner.user_id, "order").is_ok());
        assert!(ensure_owner_or_admin(&admin, owner.user_id, "order").is_ok());
        assert!(matches!(
            ensure_owner_or_admin(&stranger, owner.user_id, "order"),
            Err(AppError::Unauthorized(_))
        ));
    }

    #[test]
    fn admin_gate_is_forbidden_for_users() {
        assert!(matches!(ensure_admin(&user(Role::User)), Err(AppError::Forbidden)));
        assert!(ensure_admin(&user(Role::Admin)).is_ok());
    }
}
