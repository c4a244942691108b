//! Caller identity forwarded by the upstream gateway.
//!
//! This service does not authenticate: the gateway in front of it verifies
//! the session and forwards `x-user-id` and `x-user-admin`.

use crate::errors::AppError;
use axum::{extract::FromRequestParts, http::request::Parts};
use std::convert::Infallible;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ADMIN_HEADER: &str = "x-user-admin";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Caller {
    pub user_id: Option<String>,
    pub admin: bool,
}

impl Caller {
    pub fn require_user(&self) -> Result<&str, AppError> {
        self.user_id
            .as_deref()
            .ok_or_else(|| AppError::unauthenticated("unauthenticated: sign in first"))
    }

    pub fn require_admin(&self) -> Result<&str, AppError> {
        let user = self.require_user()?;
        if !self.admin {
            return Err(AppError::forbidden("permission-denied: admin role required"));
        }
        Ok(user)
    }
}

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };
        let user_id = header(USER_ID_HEADER).map(str::to_string);
        let admin = user_id.is_some()
            && header(USER_ADMIN_HEADER).is_some_and(|v| v.eq_ignore_ascii_case("true") || v == "1");
        Ok(Caller { user_id, admin })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Request, StatusCode};

    async fn caller(headers: &[(&str, &str)]) -> Caller {
        let mut req = Request::builder();
        for (k, v) in headers {
            req = req.header(*k, *v);
        }
        let (mut parts, _) = req.body(()).unwrap().into_parts();
        Caller::from_request_parts(&mut parts, &()).await.unwrap()
    }

    #[tokio::test]
    async fn roles_come_from_gateway_headers() {
        let anon = caller(&[]).await;
        assert_eq!(anon.require_user().unwrap_err().status, StatusCode::UNAUTHORIZED);

        let user = caller(&[(USER_ID_HEADER, "u1")]).await;
        assert_eq!(user.require_user().unwrap(), "u1");
        assert_eq!(user.require_admin().unwrap_err().status, StatusCode::FORBIDDEN);

        let admin = caller(&[(USER_ID_HEADER, "u2"), (USER_ADMIN_HEADER, "TRUE")]).await;
        assert_eq!(admin.require_admin().unwrap(), "u2");

        // the admin flag alone does not identify anyone
        let orphan = caller(&[(USER_ADMIN_HEADER, "true")]).await;
        assert!(!orphan.admin);
    }
}
