pub mod jwt;
pub mod rbac;

pub use jwt::{extract_bearer, AuthError, Principal, TokenVerifier};
pub use rbac::{authorize, RoomAction, RoomKind};
