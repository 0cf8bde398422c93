pub mod directory;
pub mod jwt;
pub mod password;

pub use directory::*;
pub use jwt::*;
pub use password::*;

use crate::{errors::Result, models::Principal};

/// Turns a bearer credential into the principal it was issued for.
pub trait PrincipalResolver: Send + Sync {
    fn resolve(&self, token: &str) -> Result<Principal>;
}
