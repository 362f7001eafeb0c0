//! Trusted caller identity.
//!
//! Authentication and role checks live in an upstream middleware; by the
//! time a handler runs, the verified identity has been inserted into the
//! request extensions. This module only defines the shape handlers consume.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

/// Verified caller identity, supplied by the auth middleware.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: Uuid,
    pub role: Role,
}

/// Admins may act on any record; regular users only on their own.
pub fn ensure_owner(caller: &AuthUser, owner_id: Uuid, message: &str) -> Result<(), AppError> {
    if caller.role == Role::User && caller.id != owner_id {
        return Err(AppError::Forbidden(message.to_string()));
    }
    Ok(())
}
