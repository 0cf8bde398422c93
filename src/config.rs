use anyhow::Result;
use serde::Deserialize;
use std::env;

pub const DEFAULT_QUOTA_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub default_quota_bytes: u64,
    pub max_upload_bytes: usize,
    pub default_page_size: u64,
    pub jwt_secret: String,
    pub token_ttl_minutes: i64,
    pub bcrypt_cost: u32,
    pub cors_allow_any: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let default_quota_bytes: u64 = env::var("DEFAULT_QUOTA_BYTES")
            .unwrap_or_else(|_| DEFAULT_QUOTA_BYTES.to_string())
            .parse()?;

        Ok(Config {
            host: env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8085".to_string())
                .parse()?,
            storage_dir: env::var("STORAGE_DIR").unwrap_or_else(|_| "./file_store".to_string()),
            default_quota_bytes,
            max_upload_bytes: env::var("MAX_UPLOAD_BYTES")
                .unwrap_or_else(|_| default_quota_bytes.to_string())
                .parse()?,
            default_page_size: env::var("DEFAULT_PAGE_SIZE")
                .unwrap_or_else(|_| "10".to_string())
                .parse()?,
            jwt_secret: env::var("JWT_SECRET").unwrap_or_else(|_| "secret".to_string()),
            token_ttl_minutes: env::var("TOKEN_TTL_MINUTES")
                .unwrap_or_else(|_| "30".to_string())
                .parse()?,
            bcrypt_cost: env::var("BCRYPT_COST")
                .unwrap_or_else(|_| bcrypt::DEFAULT_COST.to_string())
                .parse()?,
            cors_allow_any: env::var("CORS_ALLOW_ANY")
                .unwrap_or_else(|_| "true".to_string())
                .parse()?,
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "127.0.0.1".to_string(),
            port: 8085,
            storage_dir: "./file_store".to_string(),
            default_quota_bytes: DEFAULT_QUOTA_BYTES,
            max_upload_bytes: DEFAULT_QUOTA_BYTES as usize,
            default_page_size: 10,
            jwt_secret: "secret".to_string(),
            token_ttl_minutes: 30,
            bcrypt_cost: bcrypt::DEFAULT_COST,
            cors_allow_any: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 4] = ["PORT", "DEFAULT_QUOTA_BYTES", "MAX_UPLOAD_BYTES", "TOKEN_TTL_MINUTES"];

    fn clear() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear();
        let config = Config::from_env().unwrap();

        assert_eq!(config.port, 8085);
        assert_eq!(config.default_quota_bytes, 52_428_800);
        assert_eq!(config.max_upload_bytes, 52_428_800);
        assert_eq!(config.token_ttl_minutes, 30);
    }

    #[test]
    #[serial]
    fn test_upload_limit_follows_quota() {
        clear();
        env::set_var("DEFAULT_QUOTA_BYTES", "1024");
        let config = Config::from_env().unwrap();
        clear();

        assert_eq!(config.default_quota_bytes, 1024);
        assert_eq!(config.max_upload_bytes, 1024);
    }

    #[test]
    #[serial]
    fn test_invalid_number_is_an_error() {
        clear();
        env::set_var("PORT", "not-a-port");
        let result = Config::from_env();
        clear();

        assert!(result.is_err());
    }
}
