use tracing::{debug, info};

use crate::app::ports::BlobStorePort;
use crate::error::Result;
use crate::types::CandidateEntry;

/// One candidate per immediate child prefix of `prefix` in `bucket`.
pub async fn enumerate_candidates(
    store: &dyn BlobStorePort,
    bucket: &str,
    prefix: &str,
) -> Result<Vec<CandidateEntry>> {
    let prefix = with_trailing_slash(prefix);
    let children = store.list_prefixes(bucket, &prefix).await?;

    let candidates: Vec<CandidateEntry> = children
        .into_iter()
        .filter_map(|child| {
            let name = child
                .strip_prefix(prefix.as_str())
                .unwrap_or(child.as_str())
                .trim_end_matches('/')
                .to_string();
            if name.is_empty() {
                debug!("Skipping placeholder prefix {}", child);
                return None;
            }
            Some(CandidateEntry { name, prefix: with_trailing_slash(&child) })
        })
        .collect();

    info!("Found {} candidate entries under {}/{}", candidates.len(), bucket, prefix);
    Ok(candidates)
}

fn with_trailing_slash(prefix: &str) -> String {
    if prefix.is_empty() || prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{}/", prefix)
    }
}
