//! Authentication.

mod middleware;
mod token;

pub use middleware::AuthUser;
pub use token::{sign_token, verify_token};
