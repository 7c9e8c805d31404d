//! HTTP server and tenant authentication.

pub mod auth;
pub mod http;

pub use auth::{AuthError, FirstMatch, PooledKeys, StaticKeys, TenantAuthenticator};
pub use http::{bind, AppState};
