use bcrypt::{hash, verify};
use crate::errors::{AppError, Result};

/// bcrypt ignores everything past 72 bytes.
pub const MAX_PASSWORD_BYTES: usize = 72;
pub const MIN_PASSWORD_LENGTH: usize = 8;

pub struct PasswordService;

impl PasswordService {
    pub fn hash_password(password: &str, cost: u32) -> Result<String> {
        hash(password, cost)
            .map_err(|e| AppError::Auth(format!("Failed to hash password: {}", e)))
    }

    pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
        verify(password, hash)
            .map_err(|e| AppError::Auth(format!("Failed to verify password: {}", e)))
    }

    pub fn validate_password(password: &str) -> Result<()> {
        if password.chars().count() < MIN_PASSWORD_LENGTH {
            return Err(AppError::Validation(format!(
                "Password must be at least {} characters long",
                MIN_PASSWORD_LENGTH
            )));
        }

        if password.len() > MAX_PASSWORD_BYTES {
            return Err(AppError::Validation(format!(
                "Password must be at most {} bytes long",
                MAX_PASSWORD_BYTES
            )));
        }

        Ok(())
    }

    pub fn validate_username(username: &str) -> Result<()> {
        let length = username.chars().count();
        if !(3..=64).contains(&length) {
            return Err(AppError::Validation(
                "Username must be between 3 and 64 characters".to_string(),
            ));
        }

        if !username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        {
            return Err(AppError::Validation(
                "Username may only contain letters, digits, '_', '.' and '-'".to_string(),
            ));
        }

        Ok(())
    }
}
