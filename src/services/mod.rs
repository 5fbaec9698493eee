pub mod blob_client;
pub mod ingest_service;
pub mod proxy_service;
pub mod tree_service;
