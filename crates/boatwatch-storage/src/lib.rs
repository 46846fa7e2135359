//! Upstream feed HTTP client and persistence edge for BoatWatch.

use std::error::Error as StdError;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use boatwatch_core::Region;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, REFERER};
pub use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub mod store;

pub use store::{
    BoatSnapshotSource, GateStore, MemoryBoatStore, MemoryGateStore, PgStore, StoreError,
    UpsertSink, CONFLICT_KEY, UPDATE_COLUMNS,
};

pub const CRATE_NAME: &str = "boatwatch-storage";

pub const DEFAULT_FEED_BASE_URL: &str = "https://m.followme.mv/public/get_my.php?a=atoll&id=";
pub const DEFAULT_FEED_REFERER: &str = "https://m.followme.mv/public/";
pub const DEFAULT_USER_AGENT: &str = "BoatWatch/0.1 (+local)";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Region ids are appended verbatim to this prefix.
    pub base_url: String,
    pub connect_timeout: Duration,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
    /// Bind outgoing sockets to IPv4; the upstream is unreliable over IPv6.
    pub force_ipv4: bool,
    /// Skips certificate verification. Only for constrained environments
    /// that cannot validate the upstream chain.
    pub accept_invalid_certs: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_FEED_BASE_URL.to_string(),
            connect_timeout: Duration::from_secs(5),
            timeout: Duration::from_secs(8),
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
            referer: Some(DEFAULT_FEED_REFERER.to_string()),
            force_ipv4: true,
            accept_invalid_certs: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{}", describe_request_error(.0))]
    Request(#[from] reqwest::Error),
    #[error("HTTP {status}")]
    HttpStatus { status: u16 },
    #[error("{0}")]
    Transport(String),
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Request(err) if err.is_timeout())
    }
}

/// Flattens the reqwest error chain so the report carries the root cause
/// ("operation timed out", "connection refused") and not only the URL.
fn describe_request_error(err: &reqwest::Error) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = err.source();
    while let Some(inner) = source {
        let text = inner.to_string();
        if !parts.iter().any(|p| p.contains(&text)) {
            parts.push(text);
        }
        source = inner.source();
    }
    parts.join(": ")
}

/// Anything that can produce the raw response for one region.
#[async_trait]
pub trait RegionSource: Send + Sync {
    async fn fetch_region(&self, region: &Region) -> Result<FetchedResponse, FetchError>;
}

/// Single-shot HTTP client for the per-region feed endpoint. No retries: a
/// failed region is simply picked up again by the next cycle.
#[derive(Debug, Clone)]
pub struct RegionClient {
    client: reqwest::Client,
    base_url: String,
}

impl RegionClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json,text/plain,*/*"),
        );
        if let Some(referer) = &config.referer {
            headers.insert(
                REFERER,
                HeaderValue::from_str(referer).context("invalid referer header")?,
            );
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .connect_timeout(config.connect_timeout)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        if config.force_ipv4 {
            builder = builder.local_address(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        }
        if config.accept_invalid_certs {
            warn!("TLS certificate verification disabled for upstream feed (BOATWATCH_INSECURE_TLS)");
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url,
        })
    }

    pub fn region_url(&self, region: &Region) -> String {
        format!("{}{}", self.base_url, region.id)
    }
}

#[async_trait]
impl RegionSource for RegionClient {
    async fn fetch_region(&self, region: &Region) -> Result<FetchedResponse, FetchError> {
        let url = self.region_url(region);
        let span = info_span!("region_fetch", atoll = %region.code, url = %url);

        async {
            let resp = self.client.get(&url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if status != StatusCode::OK {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                });
            }

            let body = resp.bytes().await?.to_vec();
            debug!(bytes = body.len(), "region response received");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

/// Replays saved responses from `<dir>/<ATOLL CODE>.json` instead of calling
/// the upstream. A missing file is a transport failure for that region.
#[derive(Debug, Clone)]
pub struct FixtureRegionSource {
    dir: PathBuf,
}

impl FixtureRegionSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl RegionSource for FixtureRegionSource {
    async fn fetch_region(&self, region: &Region) -> Result<FetchedResponse, FetchError> {
        let path = self.dir.join(format!("{}.json", region.code));
        match tokio::fs::read(&path).await {
            Ok(body) => Ok(FetchedResponse {
                status: StatusCode::OK,
                final_url: path.display().to_string(),
                body,
            }),
            Err(err) => Err(FetchError::Transport(format!(
                "reading fixture {}: {err}",
                path.display()
            ))),
        }
    }
}
