//! Store adapter for the iRODS HTTP API gateway.
//!
//! # API Endpoints
//!
//! - `POST /authenticate` (basic auth) - returns a bearer token
//! - `GET /collections?op=stat&lpath=..` - collection existence
//! - `GET /collections?op=list&lpath=..` - direct children
//! - `POST /collections` `op=create|set_permission`
//! - `GET /data-objects?op=stat&lpath=..` - object size
//! - `POST /data-objects` multipart `op=write` - upload
//! - `POST /data-objects` `op=set_permission`
//! - `POST /tickets` `op=create` - ticket issuance
//!
//! Every JSON reply carries `irods_response.status_code`; zero is success.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::transfer::store::{
    ConnectorFactory, ObjectStat, StoreConnector, StoreSession, TicketRequest,
};

/// Status codes the gateway uses for a missing collection or object.
const NOT_FOUND_CODES: [i64; 3] = [-808_000, -310_000, -170_000];

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
struct IrodsStatus {
    status_code: i64,
    #[serde(default)]
    status_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    irods_response: IrodsStatus,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    ticket: Option<String>,
    #[serde(default)]
    entries: Vec<String>,
}

/// Opens token-authenticated sessions on the gateway.
pub struct HttpConnector {
    client: Client,
    api_url: String,
    host: String,
    user: String,
    password: SecretString,
}

impl HttpConnector {
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StoreError::Protocol(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_url: config.api_url(),
            host: config.host.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
        })
    }
}

#[async_trait]
impl StoreConnector for HttpConnector {
    fn host(&self) -> &str {
        &self.host
    }

    async fn connect(&self) -> Result<Arc<dyn StoreSession>, StoreError> {
        let response = self
            .client
            .post(format!("{}/authenticate", self.api_url))
            .basic_auth(&self.user, Some(self.password.expose_secret()))
            .send()
            .await?;
        // bad credentials will not get better on reconnect
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(StoreError::PermissionDenied(format!(
                "authenticate as {}: credentials rejected",
                self.user
            )));
        }

        let token = check_status(response, "authenticate").await?.text().await?;
        let token = token.trim();
        if token.is_empty() {
            return Err(StoreError::Protocol("empty token from authenticate".to_string()));
        }

        debug!(host = %self.host, "Store session opened");
        Ok(Arc::new(HttpSession {
            client: self.client.clone(),
            api_url: self.api_url.clone(),
            token: SecretString::from(token.to_string()),
        }))
    }
}

/// Builds `HttpConnector`s.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpConnectorFactory;

impl ConnectorFactory for HttpConnectorFactory {
    fn connector(&self, config: &StoreConfig) -> Result<Arc<dyn StoreConnector>, StoreError> {
        Ok(Arc::new(HttpConnector::new(config)?))
    }
}

struct HttpSession {
    client: Client,
    api_url: String,
    token: SecretString,
}

impl HttpSession {
    fn endpoint(&self, name: &str) -> String {
        format!("{}/{}", self.api_url, name)
    }

    async fn query(&self, endpoint: &str, params: &[(&str, &str)]) -> Result<Envelope, StoreError> {
        let response = self
            .client
            .get(self.endpoint(endpoint))
            .bearer_auth(self.token.expose_secret())
            .query(params)
            .send()
            .await?;
        envelope(response, endpoint, lpath(params)).await
    }

    async fn command(&self, endpoint: &str, params: &[(&str, &str)]) -> Result<Envelope, StoreError> {
        let response = self
            .client
            .post(self.endpoint(endpoint))
            .bearer_auth(self.token.expose_secret())
            .form(params)
            .send()
            .await?;
        envelope(response, endpoint, lpath(params)).await
    }

    async fn set_null_permission(
        &self,
        endpoint: &str,
        path: &str,
        principal: &str,
    ) -> Result<(), StoreError> {
        self.command(
            endpoint,
            &[
                ("op", "set_permission"),
                ("lpath", path),
                ("entity-name", principal),
                ("permission", "null"),
            ],
        )
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl StoreSession for HttpSession {
    async fn get_collection(&self, path: &str) -> Result<(), StoreError> {
        self.query("collections", &[("op", "stat"), ("lpath", path)])
            .await
            .map(|_| ())
    }

    async fn create_collection(&self, path: &str) -> Result<(), StoreError> {
        self.command(
            "collections",
            &[("op", "create"), ("lpath", path), ("create-intermediates", "1")],
        )
        .await
        .map(|_| ())
    }

    async fn stat_object(&self, path: &str) -> Result<ObjectStat, StoreError> {
        let reply = self
            .query("data-objects", &[("op", "stat"), ("lpath", path)])
            .await?;
        let size = reply
            .size
            .ok_or_else(|| StoreError::Protocol(format!("stat of {path} has no size")))?;
        Ok(ObjectStat {
            path: path.to_string(),
            size,
        })
    }

    async fn put_file(&self, local: &Path, remote: &str) -> Result<(), StoreError> {
        let local_io = |source| StoreError::LocalIo {
            path: local.display().to_string(),
            source,
        };
        let file = tokio::fs::File::open(local).await.map_err(local_io)?;
        let len = file.metadata().await.map_err(local_io)?.len();

        let file_name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "data".to_string());
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let form = Form::new()
            .text("op", "write")
            .text("lpath", remote.to_string())
            .text("truncate", "1")
            .part("bytes", Part::stream_with_length(body, len).file_name(file_name));

        let response = self
            .client
            .post(self.endpoint("data-objects"))
            .bearer_auth(self.token.expose_secret())
            .multipart(form)
            .send()
            .await?;
        envelope(response, "data-objects", Some(remote)).await.map(|_| ())
    }

    /// The gateway's `set_permission` does not recurse, so a recursive
    /// revoke lists each collection and sets every entry below it.
    async fn revoke_access(
        &self,
        path: &str,
        principal: &str,
        recursive: bool,
    ) -> Result<(), StoreError> {
        self.set_null_permission("collections", path, principal).await?;
        if !recursive {
            return Ok(());
        }

        let mut pending = vec![path.to_string()];
        while let Some(collection) = pending.pop() {
            let listing = self
                .query("collections", &[("op", "list"), ("lpath", collection.as_str())])
                .await?;
            for entry in listing.entries {
                debug!(path = %entry, principal, "Revoking access");
                match self.get_collection(&entry).await {
                    Ok(()) => {
                        self.set_null_permission("collections", &entry, principal).await?;
                        pending.push(entry);
                    }
                    Err(e) if e.is_not_found() => {
                        self.set_null_permission("data-objects", &entry, principal).await?;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    async fn issue_ticket(
        &self,
        path: &str,
        request: &TicketRequest,
    ) -> Result<String, StoreError> {
        let uses = request.uses_limit.map(|n| n.to_string());
        let seconds = request.expires_at.map(|at| {
            (at - chrono::Utc::now()).num_seconds().max(1).to_string()
        });

        let mut params = vec![
            ("op", "create"),
            ("lpath", path),
            ("type", request.permission.as_str()),
        ];
        if let Some(uses) = uses.as_deref() {
            params.push(("use-count", uses));
        }
        if let Some(seconds) = seconds.as_deref() {
            params.push(("seconds-until-expiration", seconds));
        }

        self.command("tickets", &params)
            .await?
            .ticket
            .ok_or_else(|| StoreError::Protocol(format!("no ticket returned for {path}")))
    }

    async fn close(&self) {
        // tokens expire on the gateway side
        debug!("Store session closed");
    }
}

fn lpath<'a>(params: &[(&str, &'a str)]) -> Option<&'a str> {
    params.iter().find(|(k, _)| *k == "lpath").map(|(_, v)| *v)
}

/// Map HTTP-level failures onto `StoreError`.
async fn check_status(response: Response, what: &str) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::UNAUTHORIZED => StoreError::SessionExpired,
        StatusCode::FORBIDDEN => StoreError::PermissionDenied(format!("{what}: {body}")),
        StatusCode::NOT_FOUND => StoreError::NotFound(what.to_string()),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            StoreError::Unavailable(format!("{what}: HTTP {}", status.as_u16()))
        }
        s if s.is_server_error() => {
            StoreError::Unavailable(format!("{what}: HTTP {} {}", s.as_u16(), body))
        }
        s => StoreError::Protocol(format!("{what}: HTTP {} {}", s.as_u16(), body)),
    })
}

/// Decode a JSON reply and map its iRODS status code.
async fn envelope(
    response: Response,
    endpoint: &str,
    path: Option<&str>,
) -> Result<Envelope, StoreError> {
    let subject = path.unwrap_or(endpoint);
    let response = check_status(response, subject).await?;
    let reply: Envelope = response.json().await?;

    match reply.irods_response.status_code {
        0 => Ok(reply),
        code if NOT_FOUND_CODES.contains(&code) => Err(StoreError::NotFound(subject.to_string())),
        code => Err(StoreError::Protocol(format!(
            "{endpoint} on {subject} failed with status {code}: {}",
            reply.irods_response.status_message.unwrap_or_default()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn config(url: &str) -> StoreConfig {
        StoreConfig {
            host: "store.example.org".to_string(),
            user: "worker".to_string(),
            password: SecretString::from("pw".to_string()),
            http_api_url: Some(url.to_string()),
            ..StoreConfig::default()
        }
    }

    async fn authenticated(server: &mut mockito::ServerGuard) -> mockito::Mock {
        server
            .mock("POST", "/authenticate")
            .match_header("authorization", Matcher::Regex("^Basic ".into()))
            .with_status(200)
            .with_body("tok-1")
            .create_async()
            .await
    }

    #[tokio::test]
    async fn connect_and_stat_object() {
        let mut server = mockito::Server::new_async().await;
        let auth = authenticated(&mut server).await;
        let stat = server
            .mock("GET", "/data-objects")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("op".into(), "stat".into()),
                Matcher::UrlEncoded("lpath".into(), "/z/run1/a.mrc".into()),
            ]))
            .match_header("authorization", "Bearer tok-1")
            .with_status(200)
            .with_body(r#"{"irods_response": {"status_code": 0}, "size": 10}"#)
            .create_async()
            .await;

        let connector = HttpConnector::new(&config(&server.url())).unwrap();
        let session = connector.connect().await.unwrap();
        let object = session.stat_object("/z/run1/a.mrc").await.unwrap();

        assert_eq!(object.size, 10);
        auth.assert_async().await;
        stat.assert_async().await;
    }

    #[tokio::test]
    async fn missing_collection_is_not_found() {
        let mut server = mockito::Server::new_async().await;
        authenticated(&mut server).await;
        server
            .mock("GET", "/collections")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"irods_response": {"status_code": -170000}}"#)
            .create_async()
            .await;

        let session = HttpConnector::new(&config(&server.url()))
            .unwrap()
            .connect()
            .await
            .unwrap();
        let err = session.get_collection("/z/nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let mut server = mockito::Server::new_async().await;
        authenticated(&mut server).await;
        server
            .mock("POST", "/collections")
            .with_status(503)
            .create_async()
            .await;

        let session = HttpConnector::new(&config(&server.url()))
            .unwrap()
            .connect()
            .await
            .unwrap();
        let err = session.create_collection("/z/run1").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn rejected_credentials_are_not_retried() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/authenticate")
            .with_status(401)
            .create_async()
            .await;

        let err = HttpConnector::new(&config(&server.url()))
            .unwrap()
            .connect()
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::PermissionDenied(_)));
        assert!(!err.is_transient());
    }

    async fn listing(server: &mut mockito::ServerGuard, path: &str, entries: &[&str]) -> mockito::Mock {
        let body = serde_json::json!({
            "irods_response": {"status_code": 0},
            "entries": entries,
        });
        server
            .mock("GET", "/collections")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("op".into(), "list".into()),
                Matcher::UrlEncoded("lpath".into(), path.into()),
            ]))
            .with_status(200)
            .with_body(body.to_string())
            .create_async()
            .await
    }

    async fn collection_stat(server: &mut mockito::ServerGuard, path: &str, status_code: i64) -> mockito::Mock {
        server
            .mock("GET", "/collections")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("op".into(), "stat".into()),
                Matcher::UrlEncoded("lpath".into(), path.into()),
            ]))
            .with_status(200)
            .with_body(format!(r#"{{"irods_response": {{"status_code": {status_code}}}}}"#))
            .create_async()
            .await
    }

    async fn null_permission(server: &mut mockito::ServerGuard, endpoint: &str, hits: usize) -> mockito::Mock {
        server
            .mock("POST", endpoint)
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("op".into(), "set_permission".into()),
                Matcher::UrlEncoded("entity-name".into(), "anonymous".into()),
                Matcher::UrlEncoded("permission".into(), "null".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"irods_response": {"status_code": 0}}"#)
            .expect(hits)
            .create_async()
            .await
    }

    #[tokio::test]
    async fn recursive_revoke_reaches_every_entry() {
        let mut server = mockito::Server::new_async().await;
        authenticated(&mut server).await;
        listing(&mut server, "/z/run1", &["/z/run1/a", "/z/run1/notes.txt"]).await;
        listing(&mut server, "/z/run1/a", &["/z/run1/a/1.mrc"]).await;
        collection_stat(&mut server, "/z/run1/a", 0).await;
        collection_stat(&mut server, "/z/run1/notes.txt", -170_000).await;
        collection_stat(&mut server, "/z/run1/a/1.mrc", -170_000).await;
        let collections = null_permission(&mut server, "/collections", 2).await;
        let objects = null_permission(&mut server, "/data-objects", 2).await;

        let session = HttpConnector::new(&config(&server.url()))
            .unwrap()
            .connect()
            .await
            .unwrap();
        session.revoke_access("/z/run1", "anonymous", true).await.unwrap();

        collections.assert_async().await;
        objects.assert_async().await;
    }

    #[tokio::test]
    async fn plain_revoke_touches_only_the_collection() {
        let mut server = mockito::Server::new_async().await;
        authenticated(&mut server).await;
        let collections = null_permission(&mut server, "/collections", 1).await;

        let session = HttpConnector::new(&config(&server.url()))
            .unwrap()
            .connect()
            .await
            .unwrap();
        session.revoke_access("/z/run1", "anonymous", false).await.unwrap();

        collections.assert_async().await;
    }

    #[tokio::test]
    async fn ticket_creation_returns_id() {
        let mut server = mockito::Server::new_async().await;
        authenticated(&mut server).await;
        let ticket = server
            .mock("POST", "/tickets")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("op".into(), "create".into()),
                Matcher::UrlEncoded("type".into(), "read".into()),
                Matcher::UrlEncoded("use-count".into(), "5".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"irods_response": {"status_code": 0}, "ticket": "AbC123"}"#)
            .create_async()
            .await;

        let session = HttpConnector::new(&config(&server.url()))
            .unwrap()
            .connect()
            .await
            .unwrap();
        let request = TicketRequest {
            permission: crate::transfer::store::TicketPermission::Read,
            expires_at: None,
            uses_limit: Some(5),
        };
        let id = session.issue_ticket("/z/run1", &request).await.unwrap();

        assert_eq!(id, "AbC123");
        ticket.assert_async().await;
    }

    #[tokio::test]
    async fn upload_streams_file() {
        let tmp = tempfile::tempdir().unwrap();
        let local = tmp.path().join("1.mrc");
        std::fs::write(&local, vec![7u8; 10]).unwrap();

        let mut server = mockito::Server::new_async().await;
        authenticated(&mut server).await;
        let write = server
            .mock("POST", "/data-objects")
            .match_header("content-type", Matcher::Regex("^multipart/form-data".into()))
            .match_body(Matcher::Regex("/z/run1/1.mrc".into()))
            .with_status(200)
            .with_body(r#"{"irods_response": {"status_code": 0}}"#)
            .create_async()
            .await;

        let session = HttpConnector::new(&config(&server.url()))
            .unwrap()
            .connect()
            .await
            .unwrap();
        session.put_file(&local, "/z/run1/1.mrc").await.unwrap();
        write.assert_async().await;
    }
}
