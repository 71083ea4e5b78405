use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::app::ports::ScrapingActorPort;
use crate::error::{MigrationError, Result};
use crate::types::ActorRun;

const PAGE_SIZE: usize = 1000;

/// Apify REST API v2.
pub struct ApifyClient {
    client: Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunInfo {
    id: String,
    default_dataset_id: Option<String>,
}

impl ApifyClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    pub fn monitor_url(actor: &str, run_id: &str) -> String {
        format!("https://console.apify.com/actors/{}/runs/{}", actor_path(actor), run_id)
    }

    async fn run_info(&self, run_id: &str) -> Result<RunInfo> {
        let url = format!("{}/v2/actor-runs/{}", self.base_url, run_id);
        let resp = check(self.client.get(url).bearer_auth(&self.token).send().await?).await?;
        Ok(resp.json::<Envelope<RunInfo>>().await?.data)
    }
}

/// `user/actor` ids are addressed as `user~actor` in URLs.
fn actor_path(actor: &str) -> String {
    actor.replace('/', "~")
}

async fn check(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(MigrationError::Auth(format!("Apify {}: {}", status, body))),
        _ => Err(MigrationError::Actor(format!("Apify {}: {}", status, body))),
    }
}

#[async_trait]
impl ScrapingActorPort for ApifyClient {
    async fn start_run(&self, actor: &str, input: Value) -> Result<ActorRun> {
        let url = format!("{}/v2/acts/{}/runs", self.base_url, actor_path(actor));
        let resp = check(self.client.post(url).bearer_auth(&self.token).json(&input).send().await?).await?;
        let run = resp.json::<Envelope<RunInfo>>().await?.data;
        info!("Started actor {} run {}", actor, run.id);
        Ok(ActorRun { actor: actor.to_string(), monitor_url: Self::monitor_url(actor, &run.id), run_id: run.id })
    }

    async fn dataset_items(&self, run_id: &str) -> Result<Vec<Value>> {
        let dataset_id = self
            .run_info(run_id)
            .await?
            .default_dataset_id
            .ok_or_else(|| MigrationError::Actor(format!("run {} has no default dataset", run_id)))?;

        let url = format!("{}/v2/datasets/{}/items", self.base_url, dataset_id);
        let mut items = Vec::new();
        loop {
            let query = [
                ("format", "json".to_string()),
                ("clean", "true".to_string()),
                ("offset", items.len().to_string()),
                ("limit", PAGE_SIZE.to_string()),
            ];
            let resp = check(self.client.get(&url).bearer_auth(&self.token).query(&query).send().await?).await?;
            let page: Vec<Value> = resp.json().await?;
            let fetched = page.len();
            items.extend(page);
            if fetched < PAGE_SIZE {
                break;
            }
        }
        debug!("Downloaded {} items from dataset {}", items.len(), dataset_id);
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actor_ids_use_tilde_in_urls() {
        assert_eq!(
            ApifyClient::monitor_url("apify/facebook-pages-scraper", "abc"),
            "https://console.apify.com/actors/apify~facebook-pages-scraper/runs/abc"
        );
    }

    #[test]
    fn parses_run_envelope() {
        let env: Envelope<RunInfo> =
            serde_json::from_str(r#"{"data": {"id": "r1", "defaultDatasetId": "d1", "status": "READY"}}"#).unwrap();
        assert_eq!(env.data.id, "r1");
        assert_eq!(env.data.default_dataset_id.as_deref(), Some("d1"));
    }
}
