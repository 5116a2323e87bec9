pub mod config;
pub mod credential_store;
pub mod error;
pub mod local_cache;
pub mod migration_flag;
pub mod realtime_client;
pub mod remote_rows;
pub mod remote_store;
pub mod rest_client;
pub mod storage;
