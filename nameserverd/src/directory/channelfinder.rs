use std::time::Duration;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use shared::types::{Channel, ResolvedAddress};
use crate::config::DirectoryConfig;
use super::Directory;

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("directory did not answer within {0:?}")]
    Timeout(Duration),
    #[error("directory request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("directory returned HTTP {0}")]
    Status(StatusCode),
    #[error("directory returned an empty body")]
    EmptyBody,
    #[error("malformed directory response: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("channel has no {0} property")]
    MissingProperty(String),
    #[error("invalid port value {0:?}")]
    InvalidPort(String),
}

impl LookupError {
    /// Errors that describe the record rather than a directory failure
    fn is_record_problem(&self) -> bool {
        matches!(self, LookupError::MissingProperty(_) | LookupError::InvalidPort(_))
    }
}

/// The query endpoint answers with a list, the per-channel endpoint with one record.
#[derive(Deserialize)]
#[serde(untagged)]
enum ChannelResponse {
    Many(Vec<Channel>),
    One(Channel),
}

/// Client for the ChannelFinder REST service.
pub struct ChannelFinderClient {
    client: reqwest::Client,
    endpoint: Url,
    config: DirectoryConfig,
}

impl ChannelFinderClient {
    pub fn new(config: DirectoryConfig) -> Result<Self> {
        let endpoint = format!(
            "{}{}",
            config.url.trim_end_matches('/'),
            config.resource_path
        );
        let endpoint = Url::parse(&endpoint)
            .with_context(|| format!("Invalid directory endpoint: {}", endpoint))?;

        let client = reqwest::Client::builder()
            .connect_timeout(config.timeout())
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { client, endpoint, config })
    }

    /// Query URL for a PV name, with the active-status filter when enabled
    pub fn query_url(&self, name: &str) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair(&self.config.name_filter, name);
            if self.config.active_only {
                query.append_pair(&self.config.status_property, &self.config.active_value);
            }
        }
        url
    }

    /// Fetch the channel record for `name`. `Ok(None)` means the directory
    /// has no such channel.
    pub async fn query(&self, name: &str) -> Result<Option<Channel>, LookupError> {
        let url = self.query_url(name);
        tracing::debug!("Querying directory: {}", url);

        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => return Ok(None),
            status if !status.is_success() => return Err(LookupError::Status(status)),
            _ => {}
        }

        let body = response.bytes().await?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(LookupError::EmptyBody);
        }

        let channel = match serde_json::from_slice::<ChannelResponse>(&body)? {
            ChannelResponse::One(channel) => Some(channel).filter(|c| c.name == name),
            ChannelResponse::Many(channels) => channels.into_iter().find(|c| c.name == name),
        };
        Ok(channel)
    }

    /// Fetch and extract the override address, without a deadline.
    pub async fn resolve(&self, name: &str) -> Result<Option<ResolvedAddress>, LookupError> {
        match self.query(name).await? {
            Some(channel) => extract_address(
                &channel,
                &self.config.host_property,
                &self.config.port_property,
            )
            .map(Some),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Directory for ChannelFinderClient {
    async fn lookup(&self, name: &str) -> Option<ResolvedAddress> {
        let deadline = self.config.timeout();
        let result = match tokio::time::timeout(deadline, self.resolve(name)).await {
            Ok(result) => result,
            Err(_) => Err(LookupError::Timeout(deadline)),
        };

        match result {
            Ok(Some(address)) => Some(address),
            Ok(None) => {
                tracing::debug!("No directory entry for {}", name);
                None
            }
            Err(e) if e.is_record_problem() => {
                tracing::debug!("Directory entry for {} has no usable address: {}", name, e);
                None
            }
            Err(e) => {
                tracing::warn!("Directory lookup for {} failed: {}", name, e);
                None
            }
        }
    }
}

/// Pull host and port out of a channel record. Property names match
/// case-insensitively and the first match wins.
pub fn extract_address(
    channel: &Channel,
    host_property: &str,
    port_property: &str,
) -> Result<ResolvedAddress, LookupError> {
    let host = channel
        .property(host_property)
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or_else(|| LookupError::MissingProperty(host_property.to_string()))?;
    let port = channel
        .property(port_property)
        .ok_or_else(|| LookupError::MissingProperty(port_property.to_string()))?;

    let port = match port.trim().parse::<u16>() {
        Ok(port) if port != 0 => port,
        _ => return Err(LookupError::InvalidPort(port.to_string())),
    };

    Ok(ResolvedAddress {
        host: host.to_string(),
        port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Instant;
    use axum::{extract::Query, http::StatusCode as HttpStatus, response::IntoResponse, routing::get, Router};
    use serde_json::json;

    const RESOURCE: &str = "/ChannelFinder/resources/channels";

    async fn spawn_directory(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    /// Stub that serves a fixed set of channels through the query endpoint
    fn channel_finder(channels: serde_json::Value) -> Router {
        Router::new().route(
            RESOURCE,
            get(move |Query(params): Query<HashMap<String, String>>| {
                let channels = channels.clone();
                async move {
                    let name = params.get("~name").cloned().unwrap_or_default();
                    let matching: Vec<_> = channels
                        .as_array()
                        .unwrap()
                        .iter()
                        .filter(|c| c["name"] == name.as_str())
                        .cloned()
                        .collect();
                    axum::Json(matching)
                }
            }),
        )
    }

    fn config(url: String) -> DirectoryConfig {
        DirectoryConfig {
            url,
            timeout_secs: 2.0,
            ..Default::default()
        }
    }

    fn fixture() -> serde_json::Value {
        json!([
            {
                "name": "XYZ:PV1",
                "owner": "cf-update",
                "properties": [
                    {"name": "iocIP", "owner": "cf-update", "value": "10.0.0.5"},
                    {"name": "pvaPort", "owner": "cf-update", "value": "5075"}
                ],
                "tags": []
            },
            {
                "name": "XYZ:NOPORT",
                "properties": [{"name": "iocIP", "value": "10.0.0.5"}]
            },
            {
                "name": "XYZ:BADPORT",
                "properties": [
                    {"name": "iocIP", "value": "10.0.0.5"},
                    {"name": "pvaPort", "value": "five"}
                ]
            },
            {
                "name": "XYZ:DUP",
                "properties": [
                    {"name": "IOCIP", "value": "10.0.0.7"},
                    {"name": "iocip", "value": "10.0.0.8"},
                    {"name": "PVAPORT", "value": "5099"}
                ]
            }
        ])
    }

    #[tokio::test]
    async fn test_lookup_resolves_record() {
        let url = spawn_directory(channel_finder(fixture())).await;
        let client = ChannelFinderClient::new(config(url)).unwrap();

        let address = client.lookup("XYZ:PV1").await.unwrap();
        assert_eq!(address, ResolvedAddress { host: "10.0.0.5".to_string(), port: 5075 });
    }

    #[tokio::test]
    async fn test_lookup_first_duplicate_wins() {
        let url = spawn_directory(channel_finder(fixture())).await;
        let client = ChannelFinderClient::new(config(url)).unwrap();

        let address = client.lookup("XYZ:DUP").await.unwrap();
        assert_eq!(address, ResolvedAddress { host: "10.0.0.7".to_string(), port: 5099 });
    }

    #[tokio::test]
    async fn test_lookup_unresolved_cases() {
        let url = spawn_directory(channel_finder(fixture())).await;
        let client = ChannelFinderClient::new(config(url)).unwrap();

        assert_eq!(client.lookup("NOPE:PV").await, None);
        assert_eq!(client.lookup("XYZ:NOPORT").await, None);
        assert_eq!(client.lookup("XYZ:BADPORT").await, None);

        assert!(matches!(
            client.resolve("XYZ:NOPORT").await,
            Err(LookupError::MissingProperty(p)) if p == "pvaPort"
        ));
        assert!(matches!(
            client.resolve("XYZ:BADPORT").await,
            Err(LookupError::InvalidPort(v)) if v == "five"
        ));
    }

    #[tokio::test]
    async fn test_not_found_and_empty_body() {
        let app = Router::new().route(
            RESOURCE,
            get(|Query(params): Query<HashMap<String, String>>| async move {
                match params.get("~name").map(String::as_str) {
                    Some("EMPTY:PV") => (HttpStatus::OK, "").into_response(),
                    Some("BROKEN:PV") => (HttpStatus::INTERNAL_SERVER_ERROR, "boom").into_response(),
                    _ => HttpStatus::NOT_FOUND.into_response(),
                }
            }),
        );
        let url = spawn_directory(app).await;
        let client = ChannelFinderClient::new(config(url)).unwrap();

        assert!(matches!(client.query("NOPE:PV").await, Ok(None)));
        assert!(matches!(client.query("EMPTY:PV").await, Err(LookupError::EmptyBody)));
        assert!(matches!(client.query("BROKEN:PV").await, Err(LookupError::Status(s)) if s == StatusCode::INTERNAL_SERVER_ERROR));

        assert_eq!(client.lookup("NOPE:PV").await, None);
        assert_eq!(client.lookup("EMPTY:PV").await, None);
        assert_eq!(client.lookup("BROKEN:PV").await, None);
    }

    #[tokio::test]
    async fn test_single_record_response() {
        let app = Router::new().route(
            RESOURCE,
            get(|| async {
                axum::Json(json!({
                    "name": "XYZ:PV1",
                    "properties": [
                        {"name": "iocIP", "value": "ioc1.example.org"},
                        {"name": "pvaPort", "value": " 5075 "}
                    ]
                }))
            }),
        );
        let url = spawn_directory(app).await;
        let client = ChannelFinderClient::new(config(url)).unwrap();

        let address = client.lookup("XYZ:PV1").await.unwrap();
        assert_eq!(address, ResolvedAddress { host: "ioc1.example.org".to_string(), port: 5075 });
        assert_eq!(client.lookup("XYZ:OTHER").await, None);
    }

    #[tokio::test]
    async fn test_slow_directory_times_out() {
        let app = Router::new().route(
            RESOURCE,
            get(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                axum::Json(json!([]))
            }),
        );
        let url = spawn_directory(app).await;
        let client = ChannelFinderClient::new(DirectoryConfig {
            timeout_secs: 0.2,
            ..config(url)
        })
        .unwrap();

        let started = Instant::now();
        assert_eq!(client.lookup("XYZ:PV1").await, None);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_directory_down() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = ChannelFinderClient::new(config(format!("http://{}", addr))).unwrap();
        assert!(matches!(client.query("XYZ:PV1").await, Err(LookupError::Transport(_))));
        assert_eq!(client.lookup("XYZ:PV1").await, None);
    }

    #[test]
    fn test_query_url() {
        let client = ChannelFinderClient::new(DirectoryConfig {
            url: "http://cf.example.org:8080/".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            client.query_url("XYZ:PV 1&x").as_str(),
            "http://cf.example.org:8080/ChannelFinder/resources/channels?%7Ename=XYZ%3APV+1%26x"
        );

        let active = ChannelFinderClient::new(DirectoryConfig {
            url: "http://cf.example.org:8080".to_string(),
            active_only: true,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            active.query_url("XYZ:PV1").as_str(),
            "http://cf.example.org:8080/ChannelFinder/resources/channels?%7Ename=XYZ%3APV1&pvStatus=Active"
        );
    }

    #[test]
    fn test_extract_rejects_port_zero() {
        let channel: Channel = serde_json::from_value(json!({
            "name": "PV",
            "properties": [
                {"name": "iocIP", "value": "10.0.0.5"},
                {"name": "pvaPort", "value": "0"}
            ]
        }))
        .unwrap();
        assert!(matches!(
            extract_address(&channel, "iocIP", "pvaPort"),
            Err(LookupError::InvalidPort(_))
        ));
    }
}
