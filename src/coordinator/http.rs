//! HTTP implementation of `RecordClient`.
//!
//! Every call is `POST {base}/api/{method}` with a single form field `attrs`
//! holding the JSON arguments. A login (`POST {base}/api/login`) establishes
//! a cookie session that the client's cookie store keeps for later calls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::coordinator::traits::RecordClient;
use crate::coordinator::types::{JsonMap, Section, SectionName, SessionRecord, Task, TaskUpdate};
use crate::error::CoordinatorError;

/// Default per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Coordinator client over HTTP.
pub struct HttpRecordClient {
    client: Client,
    base_url: String,
    user: String,
    password: SecretString,
    logged_in: AtomicBool,
}

impl HttpRecordClient {
    pub fn new(
        base_url: impl Into<String>,
        user: impl Into<String>,
        password: SecretString,
    ) -> Result<Self, CoordinatorError> {
        let client = Client::builder()
            .cookie_store(true)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user: user.into(),
            password,
            logged_in: AtomicBool::new(false),
        })
    }

    pub fn from_config(config: &WorkerConfig) -> Result<Self, CoordinatorError> {
        Self::new(
            config.coordinator_url.clone(),
            config.coordinator_user.clone(),
            config.coordinator_password.clone(),
        )
    }

    fn url(&self, method: &str) -> String {
        format!("{}/api/{}", self.base_url, method)
    }

    /// Log in with the configured account. Anonymous when no user is set.
    async fn login(&self) -> Result<(), CoordinatorError> {
        if self.user.is_empty() {
            self.logged_in.store(true, Ordering::Relaxed);
            return Ok(());
        }

        let response = self
            .client
            .post(self.url("login"))
            .form(&[
                ("username", self.user.as_str()),
                ("password", self.password.expose_secret()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CoordinatorError::Login {
                user: self.user.clone(),
                reason: format!("HTTP {}: {}", status.as_u16(), body),
            });
        }

        info!(user = %self.user, url = %self.base_url, "Logged into coordinator");
        self.logged_in.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Call an API method, re-authenticating once if the session was dropped.
    async fn request(&self, method: &str, args: Value) -> Result<Value, CoordinatorError> {
        if !self.logged_in.load(Ordering::Relaxed) {
            self.login().await?;
        }

        match self.post(method, &args).await {
            Err(CoordinatorError::UnexpectedStatus { status, .. })
                if status == StatusCode::UNAUTHORIZED.as_u16()
                    || status == StatusCode::FORBIDDEN.as_u16() =>
            {
                warn!(method, status, "Coordinator session rejected, logging in again");
                self.logged_in.store(false, Ordering::Relaxed);
                self.login().await?;
                self.post(method, &args).await
            }
            other => other,
        }
    }

    async fn post(&self, method: &str, args: &Value) -> Result<Value, CoordinatorError> {
        debug!(method, "Coordinator request");

        let response = self
            .client
            .post(self.url(method))
            .form(&[("attrs", args.to_string())])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(CoordinatorError::UnexpectedStatus {
                method: method.to_string(),
                status: status.as_u16(),
                body: truncate(&body, 500),
            });
        }

        if body.trim().is_empty() {
            return Ok(Value::Null);
        }

        let value: Value =
            serde_json::from_str(&body).map_err(|e| CoordinatorError::Decode {
                method: method.to_string(),
                reason: e.to_string(),
            })?;

        if let Some(message) = value.get("error").filter(|e| !e.is_null()) {
            return Err(CoordinatorError::Api {
                method: method.to_string(),
                message: message
                    .as_str()
                    .map(String::from)
                    .unwrap_or_else(|| message.to_string()),
            });
        }

        Ok(value)
    }

    fn decode<T: DeserializeOwned>(method: &str, value: Value) -> Result<T, CoordinatorError> {
        serde_json::from_value(value).map_err(|e| CoordinatorError::Decode {
            method: method.to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl RecordClient for HttpRecordClient {
    async fn fetch_tasks(&self, worker: &str) -> Result<Vec<Task>, CoordinatorError> {
        let method = "get_pending_tasks";
        let value = self.request(method, json!({ "worker": worker })).await?;
        let tasks = match value {
            Value::Null => return Ok(Vec::new()),
            Value::Object(mut obj) => obj.remove("tasks").unwrap_or(Value::Array(Vec::new())),
            other => other,
        };
        Self::decode(method, tasks)
    }

    async fn update_task(
        &self,
        worker: &str,
        task_id: &str,
        update: &TaskUpdate,
    ) -> Result<(), CoordinatorError> {
        self.request(
            "update_task",
            json!({ "worker": worker, "task_id": task_id, "event": update }),
        )
        .await?;
        Ok(())
    }

    async fn get_session(&self, id: i64) -> Result<SessionRecord, CoordinatorError> {
        let method = "get_session";
        let value = self.request(method, json!({ "id": id })).await?;
        if value.is_null() {
            return Err(CoordinatorError::NotFound {
                entity: "session".to_string(),
                id: id.to_string(),
            });
        }
        Self::decode(method, value)
    }

    async fn update_session_extra(
        &self,
        id: i64,
        name: SectionName,
        section: &Section,
    ) -> Result<(), CoordinatorError> {
        let mut extra = JsonMap::new();
        extra.insert(name.as_str().to_string(), serde_json::to_value(section).unwrap_or_default());
        extra.insert(
            "updated".to_string(),
            Value::String(chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()),
        );

        self.request("update_session_extra", json!({ "id": id, "extra": extra }))
            .await?;
        Ok(())
    }

    async fn get_config(&self, section: &str) -> Result<JsonMap, CoordinatorError> {
        let method = "get_config";
        match self.request(method, json!({ "config": section })).await? {
            Value::Object(map) => Ok(map),
            Value::Null => Err(CoordinatorError::NotFound {
                entity: "config".to_string(),
                id: section.to_string(),
            }),
            other => Err(CoordinatorError::Decode {
                method: method.to_string(),
                reason: format!("expected an object, got {other}"),
            }),
        }
    }
}

/// Truncate a response body for error messages (UTF-8 safe).
fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max).collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn client(url: &str, user: &str) -> HttpRecordClient {
        HttpRecordClient::new(url, user, SecretString::from("pw".to_string())).unwrap()
    }

    #[tokio::test]
    async fn fetch_tasks_decodes_list() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/get_pending_tasks")
            .match_body(Matcher::Regex("worker".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"[{"id": "17-0", "name": "session", "args": {"session_id": 3, "action": "monitor"}}]"#,
            )
            .create_async()
            .await;

        let tasks = client(&server.url(), "").fetch_tasks("w1").await.unwrap();
        mock.assert_async().await;

        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, "17-0");
        assert_eq!(tasks[0].arg_str("action").as_deref(), Some("monitor"));
    }

    #[tokio::test]
    async fn logs_in_before_first_call() {
        let mut server = mockito::Server::new_async().await;
        let login = server
            .mock("POST", "/api/login")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("username".into(), "bot".into()),
                Matcher::UrlEncoded("password".into(), "pw".into()),
            ]))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;
        let config = server
            .mock("POST", "/api/get_config")
            .with_status(200)
            .with_body(r#"{"scipion_path": "/opt/scipion/scipion3"}"#)
            .expect(2)
            .create_async()
            .await;

        let client = client(&server.url(), "bot");
        let section = client.get_config("scipion").await.unwrap();
        assert_eq!(section["scipion_path"], "/opt/scipion/scipion3");
        client.get_config("scipion").await.unwrap();

        login.assert_async().await;
        config.assert_async().await;
    }

    #[tokio::test]
    async fn api_error_is_surfaced() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/get_session")
            .with_status(200)
            .with_body(r#"{"error": "Session 9 not found"}"#)
            .create_async()
            .await;

        let err = client(&server.url(), "").get_session(9).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Api { ref message, .. } if message.contains("not found")));
    }

    #[tokio::test]
    async fn http_failure_is_unexpected_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/update_task")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let err = client(&server.url(), "")
            .update_task("w1", "1", &TaskUpdate::new().done())
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::UnexpectedStatus { status: 500, .. }));
    }

    #[tokio::test]
    async fn update_session_extra_sends_named_section() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/update_session_extra")
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex("otf".into()),
                Matcher::Regex("updated".into()),
            ]))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let mut otf = Section::default();
        otf.set("status", "created");
        client(&server.url(), "")
            .update_session_extra(5, SectionName::Otf, &otf)
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[test]
    fn truncate_is_char_safe() {
        assert_eq!(truncate("héllo", 10), "héllo");
        assert_eq!(truncate("héllo", 2), "hé...");
    }
}
