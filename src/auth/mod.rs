#![forbid(unsafe_code)]

pub mod types;
pub mod bearer;
pub mod token;

pub use bearer::authorize;
pub use types::AuthError;
