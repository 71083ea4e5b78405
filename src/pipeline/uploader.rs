use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::app::ports::{BlobStorePort, HttpClientPort};
use crate::constants::IMAGE_CONTENT_TYPE;
use crate::error::{MigrationError, Result};
use crate::metrics::MigrationMetrics;
use crate::types::{ArtifactSource, ImageArtifact};

pub fn public_url(host: &str, bucket: &str, object_name: &str) -> String {
    format!("https://storage.{}/{}/{}", host, bucket, object_name)
}

#[derive(Debug, Clone)]
pub struct UploadedArtifact {
    pub artifact: ImageArtifact,
    pub public_url: String,
}

#[derive(Debug, Clone)]
pub struct FailedUpload {
    pub artifact: ImageArtifact,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct UploadReport {
    pub uploaded: Vec<UploadedArtifact>,
    pub failed: Vec<FailedUpload>,
    /// Artifacts dropped because their destination name was already queued.
    pub duplicates: usize,
    /// First credential or configuration error seen by any worker. The
    /// caller must not record the batch when this is set.
    pub fatal: Option<MigrationError>,
}

impl UploadReport {
    pub fn uploaded_for(&self, id_scraping: &str) -> usize {
        self.uploaded.iter().filter(|u| u.artifact.id_scraping == id_scraping).count()
    }
}

/// Copies artifacts into the destination bucket on a bounded worker pool.
/// Each artifact is independent: a failure is recorded and its siblings
/// keep going. There is no retry.
pub struct ParallelUploader {
    source: Arc<dyn BlobStorePort>,
    dest: Arc<dyn BlobStorePort>,
    http: Arc<dyn HttpClientPort>,
    dest_bucket: String,
    host: String,
    workers: usize,
}

impl ParallelUploader {
    pub fn new(
        source: Arc<dyn BlobStorePort>,
        dest: Arc<dyn BlobStorePort>,
        http: Arc<dyn HttpClientPort>,
        dest_bucket: impl Into<String>,
        host: impl Into<String>,
        workers: usize,
    ) -> Self {
        Self {
            source,
            dest,
            http,
            dest_bucket: dest_bucket.into(),
            host: host.into(),
            workers: workers.max(1),
        }
    }

    /// Detection failures are treated as uniform access, so no ACL call is made.
    pub async fn detect_uniform_access(&self) -> bool {
        match self.dest.uniform_access(&self.dest_bucket).await {
            Ok(uniform) => {
                info!("Uniform bucket-level access on {}: {}", self.dest_bucket, uniform);
                uniform
            }
            Err(e) => {
                warn!("Could not read access policy of {} ({}); assuming uniform access", self.dest_bucket, e);
                true
            }
        }
    }

    pub async fn upload_all(&self, artifacts: Vec<ImageArtifact>, uniform_access: bool) -> UploadReport {
        let mut report = UploadReport::default();
        let mut seen: HashSet<String> = HashSet::new();
        let mut queued: Vec<ImageArtifact> = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            if seen.insert(artifact.destination_name.clone()) {
                queued.push(artifact);
            } else {
                report.duplicates += 1;
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks: JoinSet<(usize, Result<String>)> = JoinSet::new();

        for (idx, artifact) in queued.iter().cloned().enumerate() {
            let semaphore = semaphore.clone();
            let source = self.source.clone();
            let dest = self.dest.clone();
            let http = self.http.clone();
            let bucket = self.dest_bucket.clone();
            let host = self.host.clone();
            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(p) => p,
                    Err(e) => return (idx, Err(MigrationError::Worker(e.to_string()))),
                };
                let result =
                    copy_one(source.as_ref(), dest.as_ref(), http.as_ref(), &bucket, &host, &artifact, uniform_access)
                        .await;
                (idx, result)
            });
        }

        let mut results: Vec<Option<Result<String>>> = queued.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, result)) => results[idx] = Some(result),
                Err(e) => warn!("Upload worker aborted: {}", e),
            }
        }

        for (artifact, result) in queued.into_iter().zip(results) {
            match result {
                Some(Ok(public_url)) => {
                    MigrationMetrics::record_upload(true);
                    report.uploaded.push(UploadedArtifact { artifact, public_url });
                }
                Some(Err(e)) => {
                    MigrationMetrics::record_upload(false);
                    warn!(
                        stage = "UPLOAD",
                        id_scraping = %artifact.id_scraping,
                        "Failed to upload {} from {}: {}",
                        artifact.destination_name,
                        artifact.source,
                        e
                    );
                    report.failed.push(FailedUpload { artifact, error: e.to_string() });
                    if e.is_fatal() && report.fatal.is_none() {
                        report.fatal = Some(e);
                    }
                }
                None => {
                    MigrationMetrics::record_upload(false);
                    report.failed.push(FailedUpload { artifact, error: "upload worker aborted".into() });
                }
            }
        }

        info!(
            "Uploaded {} artifacts ({} failed, {} duplicate names dropped)",
            report.uploaded.len(),
            report.failed.len(),
            report.duplicates
        );
        report
    }
}

async fn copy_one(
    source: &dyn BlobStorePort,
    dest: &dyn BlobStorePort,
    http: &dyn HttpClientPort,
    dest_bucket: &str,
    host: &str,
    artifact: &ImageArtifact,
    uniform_access: bool,
) -> Result<String> {
    let bytes = match &artifact.source {
        ArtifactSource::Blob { bucket, path } => source.read_blob(bucket, path).await?,
        ArtifactSource::Url(url) => {
            let resp = http.get(url).await?;
            if !(200..300).contains(&resp.status) {
                return Err(MigrationError::BlobStore(format!("download of {} returned HTTP {}", url, resp.status)));
            }
            resp.bytes
        }
    };

    dest.write_blob(dest_bucket, &artifact.destination_name, bytes, IMAGE_CONTENT_TYPE).await?;

    if !uniform_access {
        if let Err(e) = dest.make_public(dest_bucket, &artifact.destination_name).await {
            warn!("Uploaded {} but could not make it public: {}", artifact.destination_name, e);
        }
    }

    debug!("Uploaded {}", artifact.destination_name);
    Ok(public_url(host, dest_bucket, &artifact.destination_name))
}
