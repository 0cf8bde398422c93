pub mod metadata_catalog;
pub mod quota_ledger;
pub mod storage_service;

pub use metadata_catalog::*;
pub use quota_ledger::*;
pub use storage_service::*;
