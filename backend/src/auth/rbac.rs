//! Room access control for the event gateway
//!
//! All subscribe/unsubscribe checks go through [`authorize`], which reads a
//! single allow-list keyed by room kind and action. Pairs missing from the
//! table are denied.

use std::collections::HashSet;

use crate::error::{ApiResult, AppError};

pub mod roles {
    pub const ADMIN: &str = "admin";
    pub const API_USER: &str = "api-user";
    pub const VIEWER: &str = "viewer";
}

/// Room namespaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomKind {
    Queue,
    AllJobs,
    Job,
}

impl RoomKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::AllJobs => "all-jobs",
            Self::Job => "job",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomAction {
    Subscribe,
    Unsubscribe,
}

impl RoomAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

/// Who may perform an action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleRequirement {
    /// At least one of the listed roles
    AnyOf(&'static [&'static str]),
    /// Any authenticated client, whatever its roles
    Authenticated,
}

impl RoleRequirement {
    pub fn is_satisfied_by(&self, user_roles: &HashSet<String>) -> bool {
        match self {
            Self::AnyOf(allowed) => allowed.iter().any(|role| user_roles.contains(*role)),
            Self::Authenticated => true,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::AnyOf(allowed) => allowed.join(" or "),
            Self::Authenticated => "any".to_string(),
        }
    }
}

pub const ROOM_POLICY: &[(RoomKind, RoomAction, RoleRequirement)] = &[
    (
        RoomKind::Queue,
        RoomAction::Subscribe,
        RoleRequirement::AnyOf(&[roles::ADMIN, roles::API_USER]),
    ),
    (
        RoomKind::AllJobs,
        RoomAction::Subscribe,
        RoleRequirement::AnyOf(&[roles::ADMIN]),
    ),
    (
        RoomKind::Job,
        RoomAction::Subscribe,
        RoleRequirement::AnyOf(&[roles::ADMIN, roles::API_USER, roles::VIEWER]),
    ),
    (RoomKind::Queue, RoomAction::Unsubscribe, RoleRequirement::Authenticated),
    (RoomKind::AllJobs, RoomAction::Unsubscribe, RoleRequirement::Authenticated),
    (RoomKind::Job, RoomAction::Unsubscribe, RoleRequirement::Authenticated),
];

pub fn requirement_for(kind: RoomKind, action: RoomAction) -> Option<RoleRequirement> {
    ROOM_POLICY
        .iter()
        .find(|(k, a, _)| *k == kind && *a == action)
        .map(|(_, _, requirement)| *requirement)
}

/// Check `user_roles` against the policy table
pub fn authorize(
    user_roles: &HashSet<String>,
    kind: RoomKind,
    action: RoomAction,
    resource: &str,
) -> ApiResult<()> {
    match requirement_for(kind, action) {
        Some(requirement) if requirement.is_satisfied_by(user_roles) => Ok(()),
        Some(requirement) => Err(AppError::AccessDenied {
            resource: resource.to_string(),
            required: requirement.describe(),
        }),
        None => Err(AppError::AccessDenied {
            resource: resource.to_string(),
            required: format!("{}:{}", kind.as_str(), action.as_str()),
        }),
    }
}
