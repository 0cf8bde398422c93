use crate::{
    auth::{JwtService, UserDirectory},
    config::Config,
    services::{InMemoryCatalog, InMemoryQuotaLedger, StorageService},
    storage::BlobStore,
};
use std::sync::Arc;

pub mod auth;
pub mod docs;
pub mod files;
pub mod health;
pub mod user;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub storage: Arc<StorageService>,
    pub users: Arc<UserDirectory>,
    pub jwt: Arc<JwtService>,
}

impl AppState {
    /// Wires in-memory accounting and metadata around the given blob store.
    pub fn new(config: Config, blobs: Arc<dyn BlobStore>) -> Self {
        let storage = StorageService::new(
            Arc::new(InMemoryQuotaLedger::new()),
            Arc::new(InMemoryCatalog::new()),
            blobs,
        );
        let jwt = JwtService::new(
            &config.jwt_secret,
            chrono::Duration::minutes(config.token_ttl_minutes),
        );

        Self {
            config,
            storage: Arc::new(storage),
            users: Arc::new(UserDirectory::new()),
            jwt: Arc::new(jwt),
        }
    }
}
