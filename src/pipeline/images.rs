use std::collections::HashSet;
use tracing::{debug, warn};

use crate::app::ports::BlobStorePort;
use crate::constants::{COVER_BLOB, DEST_EXTENSION, IMAGE_EXTENSIONS, POSTS_DIR, PROFILE_BLOB};
use crate::error::Result;
use crate::types::{ArtifactKind, ArtifactSource, ImageArtifact};

/// `{id_scraping}_{suffix}.jpg`
pub fn destination_name(id_scraping: &str, kind: ArtifactKind) -> String {
    format!("{}_{}{}", id_scraping, kind.suffix(), DEST_EXTENSION)
}

pub fn is_image_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    IMAGE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Destination names handed out so far in this run.
#[derive(Debug, Default)]
pub struct NameRegistry {
    claimed: HashSet<String>,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// False when the name was already handed out.
    pub fn claim(&mut self, name: &str) -> bool {
        self.claimed.insert(name.to_string())
    }

    pub fn len(&self) -> usize {
        self.claimed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claimed.is_empty()
    }
}

fn push_artifact(
    out: &mut Vec<ImageArtifact>,
    registry: &mut NameRegistry,
    id_scraping: &str,
    country: &str,
    kind: ArtifactKind,
    source: ArtifactSource,
) {
    let destination_name = destination_name(id_scraping, kind);
    if !registry.claim(&destination_name) {
        warn!(stage = "RESOLVE_IMAGES", id_scraping, "Destination {} already claimed, skipping {}", destination_name, source);
        return;
    }
    out.push(ImageArtifact {
        id_scraping: id_scraping.to_string(),
        country: country.to_string(),
        source,
        destination_name,
        kind,
    });
}

/// Probes the source bucket for the known slots of one scraped entry.
pub struct ImageResolver {
    bucket: String,
}

impl ImageResolver {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self { bucket: bucket.into() }
    }

    /// Cover and profile come from fixed names; posts are every image under
    /// `Posts/`, numbered in listing order. Missing slots are omitted.
    pub async fn resolve(
        &self,
        store: &dyn BlobStorePort,
        id_scraping: &str,
        country: &str,
        entry_prefix: &str,
        registry: &mut NameRegistry,
    ) -> Result<Vec<ImageArtifact>> {
        let mut artifacts = Vec::new();

        for (file, kind) in [(COVER_BLOB, ArtifactKind::Cover), (PROFILE_BLOB, ArtifactKind::Profile)] {
            let path = format!("{}{}", entry_prefix, file);
            if store.blob_exists(&self.bucket, &path).await? {
                let source = ArtifactSource::Blob { bucket: self.bucket.clone(), path };
                push_artifact(&mut artifacts, registry, id_scraping, country, kind, source);
            } else {
                debug!(id_scraping, "No {} for entry", file);
            }
        }

        let posts_prefix = format!("{}{}", entry_prefix, POSTS_DIR);
        let posts: Vec<String> = store
            .list_blobs(&self.bucket, &posts_prefix)
            .await?
            .into_iter()
            .filter(|name| !name.ends_with('/') && is_image_name(name))
            .collect();

        for (i, path) in posts.into_iter().enumerate() {
            let source = ArtifactSource::Blob { bucket: self.bucket.clone(), path };
            push_artifact(&mut artifacts, registry, id_scraping, country, ArtifactKind::Post(i + 1), source);
        }

        Ok(artifacts)
    }
}

/// Artifacts for a company whose images are remote URLs (actor datasets).
pub fn artifacts_from_urls(
    id_scraping: &str,
    country: &str,
    profile_url: Option<&str>,
    cover_url: Option<&str>,
    post_urls: &[String],
    registry: &mut NameRegistry,
) -> Vec<ImageArtifact> {
    let mut artifacts = Vec::new();
    let present = |u: Option<&str>| u.map(str::trim).filter(|u| !u.is_empty()).map(str::to_string);

    if let Some(url) = present(profile_url) {
        push_artifact(&mut artifacts, registry, id_scraping, country, ArtifactKind::Profile, ArtifactSource::Url(url));
    }
    if let Some(url) = present(cover_url) {
        push_artifact(&mut artifacts, registry, id_scraping, country, ArtifactKind::Cover, ArtifactSource::Url(url));
    }
    let posts = post_urls.iter().filter_map(|u| present(Some(u.as_str())));
    for (i, url) in posts.enumerate() {
        push_artifact(&mut artifacts, registry, id_scraping, country, ArtifactKind::Post(i + 1), ArtifactSource::Url(url));
    }
    artifacts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::in_memory::InMemoryBlobStore;

    #[tokio::test]
    async fn logo_only_entry_yields_one_profile_artifact() {
        let store = InMemoryBlobStore::new();
        store.put("src", "root/Acme/Logo.jpg", b"logo");

        let mut registry = NameRegistry::new();
        let found = ImageResolver::new("src")
            .resolve(&store, "123", "Brasil", "root/Acme/", &mut registry)
            .await
            .unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, ArtifactKind::Profile);
        assert_eq!(found[0].destination_name, "123_profile_image.jpg");
    }

    #[tokio::test]
    async fn posts_are_numbered_in_listing_order() {
        let store = InMemoryBlobStore::new();
        store.put("src", "root/Sol/Banner.jpg", b"b");
        store.put("src", "root/Sol/Logo.jpg", b"l");
        store.put("src", "root/Sol/Posts/", b"");
        store.put("src", "root/Sol/Posts/Post1.jpg", b"1");
        store.put("src", "root/Sol/Posts/Post2.PNG", b"2");
        store.put("src", "root/Sol/Posts/Post3.jpeg", b"3");
        store.put("src", "root/Sol/Posts/notes.txt", b"x");

        let mut registry = NameRegistry::new();
        let found = ImageResolver::new("src")
            .resolve(&store, "9", "Brasil", "root/Sol/", &mut registry)
            .await
            .unwrap();

        let names: Vec<&str> = found.iter().map(|a| a.destination_name.as_str()).collect();
        assert_eq!(
            names,
            vec!["9_cover_image.jpg", "9_profile_image.jpg", "9_post_1.jpg", "9_post_2.jpg", "9_post_3.jpg"]
        );
        let unique: HashSet<&str> = names.iter().copied().collect();
        assert_eq!(unique.len(), names.len());
    }

    #[test]
    fn registry_rejects_reused_names() {
        let mut registry = NameRegistry::new();
        let first = artifacts_from_urls("5", "Mexico", Some("https://x/p.jpg"), None, &[], &mut registry);
        let again = artifacts_from_urls("5", "Mexico", Some("https://x/p2.jpg"), None, &[], &mut registry);
        assert_eq!(first.len(), 1);
        assert!(again.is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn url_artifacts_skip_blank_urls() {
        let mut registry = NameRegistry::new();
        let posts = vec!["https://x/1.jpg".to_string(), " ".to_string(), "https://x/2.jpg".to_string()];
        let found = artifacts_from_urls("5", "Mexico", Some(""), Some("https://x/c.jpg"), &posts, &mut registry);
        let kinds: Vec<ArtifactKind> = found.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![ArtifactKind::Cover, ArtifactKind::Post(1), ArtifactKind::Post(2)]);
    }
}
