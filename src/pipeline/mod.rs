pub mod datasets;
pub mod dedup;
pub mod enumerate;
pub mod images;
pub mod ledger;
pub mod matcher;
pub mod uploader;
pub mod writer;
