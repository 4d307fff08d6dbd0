//! Directory service client
//!
//! Registers this relay's address under its application name and lists the
//! hosts other relays registered. Both calls are bounded by the client timeout
//! so a stalled directory cannot hold up the caller.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::DiscoveryError;
use crate::model::host::AppHost;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct GetAppsResponse {
    #[serde(default)]
    apps: Vec<AppHost>,
}

#[derive(Debug, Serialize)]
struct RegisterAppRequest<'a> {
    addr: &'a str,
    app_name: &'a str,
}

#[derive(Debug, Clone)]
pub struct DiscoveryClient {
    http: Client,
    host: String,
}

impl DiscoveryClient {
    pub fn new(host: impl Into<String>, timeout: Duration) -> Result<DiscoveryClient, DiscoveryError> {
        let http = Client::builder().timeout(timeout).build()?;
        let host = host.into().trim_end_matches('/').to_string();

        Ok(DiscoveryClient { http, host })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub async fn register(&self, addr: &str, app_name: &str) -> Result<(), DiscoveryError> {
        let url = format!("{}/register", self.host);
        debug!(%url, addr, app_name, "Registering with directory");

        self.http
            .post(url)
            .json(&RegisterAppRequest { addr, app_name })
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }

    pub async fn list_hosts(&self) -> Result<Vec<AppHost>, DiscoveryError> {
        let url = format!("{}/get-apps", self.host);

        let response: GetAppsResponse = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(response.apps)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::{extract::State, routing::get, routing::post, Json, Router};
    use serde_json::{json, Value};
    use tokio::net::TcpListener;

    use super::*;

    type Directory = Arc<Mutex<Vec<AppHost>>>;

    async fn spawn_directory(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn stub_directory() -> Router {
        let directory: Directory = Arc::default();

        Router::new()
            .route(
                "/register",
                post(|State(dir): State<Directory>, Json(host): Json<AppHost>| async move {
                    dir.lock().unwrap().push(host);
                }),
            )
            .route(
                "/get-apps",
                get(|State(dir): State<Directory>| async move {
                    Json(json!({ "apps": dir.lock().unwrap().clone() }))
                }),
            )
            .with_state(directory)
    }

    #[tokio::test]
    async fn registered_host_is_listed() {
        let url = spawn_directory(stub_directory()).await;
        let client = DiscoveryClient::new(url, DEFAULT_TIMEOUT).unwrap();

        assert!(client.list_hosts().await.unwrap().is_empty());

        client.register("10.1.2.3:8080", "Notepad").await.unwrap();
        let hosts = client.list_hosts().await.unwrap();

        assert_eq!(hosts, vec![AppHost::new("10.1.2.3:8080", "Notepad")]);
    }

    #[tokio::test]
    async fn stalled_directory_is_unavailable() {
        let router = Router::new().route(
            "/get-apps",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(json!({ "apps": [] }))
            }),
        );
        let url = spawn_directory(router).await;
        let client = DiscoveryClient::new(url, Duration::from_millis(200)).unwrap();

        let err = client.list_hosts().await.unwrap_err();
        assert!(matches!(err, DiscoveryError::DirectoryUnavailable(_)));
    }

    #[tokio::test]
    async fn error_status_is_unavailable() {
        let router = Router::new().route(
            "/get-apps",
            get(|| async { (axum::http::StatusCode::SERVICE_UNAVAILABLE, Json(Value::Null)) }),
        );
        let url = spawn_directory(router).await;
        let client = DiscoveryClient::new(url, DEFAULT_TIMEOUT).unwrap();

        assert!(client.list_hosts().await.is_err());
    }

    #[tokio::test]
    async fn unreachable_directory_is_unavailable() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = DiscoveryClient::new(format!("http://{addr}"), DEFAULT_TIMEOUT).unwrap();
        assert!(client.register("1.2.3.4:1", "x").await.is_err());
    }
}
