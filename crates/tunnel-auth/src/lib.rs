//! Session-token issuance and credential comparison for control-connection
//! authentication.

pub mod constant_time;
pub mod jwt;

pub use constant_time::credentials_match;
pub use jwt::{JwtClaims, JwtError, JwtValidator};
