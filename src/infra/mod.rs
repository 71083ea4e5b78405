pub mod apify_client;
pub mod file_ledger;
pub mod fs_blob_store;
pub mod gcs_blob_store;
pub mod http_client;
pub mod in_memory;
pub mod sqlite_tables;
pub mod vertex_classifier;
