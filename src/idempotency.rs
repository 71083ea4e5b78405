use sha2::{Digest, Sha256};

/// Deterministic image id from the owning entry and the artifact suffix, so a
/// rerun over the same entry derives the same `id_photo_cleaned`.
pub fn photo_id(id_scraping: &str, suffix: &str) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}_{}", id_scraping, suffix).as_bytes());
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    // high bit cleared
    (u64::from_be_bytes(head) & i64::MAX as u64) as i64
}

/// Hex digest used in logs to correlate an image row with its source.
pub fn photo_digest(id_scraping: &str, suffix: &str) -> String {
    hex::encode(Sha256::digest(format!("{}_{}", id_scraping, suffix).as_bytes()))
}
