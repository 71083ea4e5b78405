use std::future::Future;
use std::time::Duration;

use crate::error::{MigrationError, Result};

/// Run `fut` for at most `limit`. Elapsed calls are dropped and surface as
/// `MigrationError::Timeout`; the call's own errors pass through unchanged.
pub async fn bounded_call<T, F>(limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(MigrationError::Timeout(limit)),
    }
}
