//! CLI command implementations.

pub mod builds;
pub mod catalog;

use anyhow::{Context, Result, anyhow};
use reqwest::{Client, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

/// Thin JSON client for the isoforge API.
pub struct ApiClient {
    http: Client,
    base: Url,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    reason: Option<String>,
}

impl ApiClient {
    pub fn new(api_url: &str) -> Result<Self> {
        let mut base = Url::parse(api_url).with_context(|| format!("invalid API URL {api_url}"))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            http: Client::new(),
            base,
        })
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    /// Resolve a path relative to the API root.
    pub fn url(&self, path: &str) -> Result<Url> {
        Ok(self.base.join(path.trim_start_matches('/'))?)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.get_with_query(path, &[]).await
    }

    pub async fn get_with_query<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let url = self.url(path)?;
        debug!(url = %url, "GET");
        let response = self.http.get(url).query(query).send().await?;
        decode(response).await
    }

    pub async fn post<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: serde::Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.url(path)?;
        debug!(url = %url, "POST");
        let response = self.http.post(url).json(body).send().await?;
        decode(response).await
    }
}

/// Decode a JSON body, turning API error bodies into readable errors.
async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let text = response.text().await.unwrap_or_default();
    Err(match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => match body.reason {
            Some(reason) => anyhow!("{} ({status}, {reason})", body.error),
            None => anyhow!("{} ({status})", body.error),
        },
        Err(_) => anyhow!("request failed with {status}: {text}"),
    })
}
