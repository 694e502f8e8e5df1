//! REST implementation of the backend adapter port.
//!
//! Speaks a PostgREST-flavored protocol: filters ride in the query string,
//! mutations ask for `return=representation`, and an empty representation on
//! insert or update reads as a row-level-authorization silent refusal rather
//! than an error.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use tidemark_core::remote::ports::{ChannelSubscription, RemoteAdapter};
use tidemark_core::{RemoteError, RemoteResult};
use tidemark_domain::entity;
use tidemark_domain::{Entity, Filter, FilterOp, Session};
use tracing::instrument;

use super::channel::spawn_channel_task;
use super::client::ApiClient;

/// REST backend adapter.
pub struct RestRemoteAdapter {
    client: Arc<ApiClient>,
}

#[derive(Debug, Deserialize)]
struct SessionDto {
    user_id: String,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct UserDto {
    id: String,
}

impl RestRemoteAdapter {
    /// Adapter over the shared HTTP client.
    pub fn new(client: Arc<ApiClient>) -> Self {
        Self { client }
    }

    fn table_path(table: &str, query: &[(String, String)]) -> String {
        let mut path = format!("/{table}");
        if !query.is_empty() {
            let encoded: Vec<String> = query
                .iter()
                .map(|(k, v)| format!("{}={}", urlencode(k), urlencode(v)))
                .collect();
            path.push('?');
            path.push_str(&encoded.join("&"));
        }
        path
    }

    fn parse_rows(body: &str) -> RemoteResult<Vec<Entity>> {
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }
        match serde_json::from_str::<Value>(body) {
            Ok(Value::Array(rows)) => rows
                .into_iter()
                .map(|row| match row {
                    Value::Object(map) => Ok(map),
                    _ => Err(RemoteError::Server("row is not an object".to_string())),
                })
                .collect(),
            Ok(Value::Null) => Ok(Vec::new()),
            Ok(_) => Err(RemoteError::Server("expected a row array".to_string())),
            Err(e) => Err(RemoteError::Server(format!("response parse failed: {e}"))),
        }
    }

    fn filter_pair(filter: &Filter) -> (String, String) {
        let op = match filter.op {
            FilterOp::Eq => "eq",
            FilterOp::Lt => "lt",
            FilterOp::Lte => "lte",
            FilterOp::Gt => "gt",
            FilterOp::Gte => "gte",
        };
        (filter.field.clone(), format!("{op}.{}", filter_value(&filter.value)))
    }
}

#[async_trait]
impl RemoteAdapter for RestRemoteAdapter {
    #[instrument(skip(self, filters))]
    async fn select(
        &self,
        table: &str,
        columns: &str,
        updated_after: Option<DateTime<Utc>>,
        filters: &[Filter],
    ) -> RemoteResult<Vec<Entity>> {
        let mut query = vec![
            ("select".to_string(), columns.to_string()),
            ("order".to_string(), "updated_at.asc,id.asc".to_string()),
        ];
        if let Some(cursor) = updated_after {
            query.push((entity::UPDATED_AT.to_string(), format!("gt.{}", cursor.to_rfc3339())));
        }
        for filter in filters {
            query.push(Self::filter_pair(filter));
        }

        let path = Self::table_path(table, &query);
        let (_, body) = self.client.send(self.client.request(Method::GET, &path)).await?;
        Self::parse_rows(&body)
    }

    async fn insert_returning_id(&self, table: &str, row: &Entity) -> RemoteResult<Option<String>> {
        let path = Self::table_path(table, &[]);
        let builder = self
            .client
            .request(Method::POST, &path)
            .header("Prefer", "return=representation")
            .json(row);

        let (_, body) = self.client.send(builder).await?;
        let rows = Self::parse_rows(&body)?;
        Ok(rows.first().and_then(|r| entity::id(r)).map(str::to_string))
    }

    async fn update_returning_id(
        &self,
        table: &str,
        id: &str,
        patch: &Entity,
    ) -> RemoteResult<Option<String>> {
        let query = vec![(entity::ID.to_string(), format!("eq.{id}"))];
        let path = Self::table_path(table, &query);
        let builder = self
            .client
            .request(Method::PATCH, &path)
            .header("Prefer", "return=representation")
            .json(patch);

        let (_, body) = self.client.send(builder).await?;
        let rows = Self::parse_rows(&body)?;
        Ok(rows.first().and_then(|r| entity::id(r)).map(str::to_string))
    }

    async fn delete_where(&self, table: &str, filters: &[Filter]) -> RemoteResult<Vec<String>> {
        let query: Vec<(String, String)> = filters.iter().map(Self::filter_pair).collect();
        let path = Self::table_path(table, &query);
        let builder =
            self.client.request(Method::DELETE, &path).header("Prefer", "return=representation");

        let (_, body) = self.client.send(builder).await?;
        let rows = Self::parse_rows(&body)?;
        Ok(rows.iter().filter_map(|r| entity::id(r)).map(str::to_string).collect())
    }

    async fn session(&self) -> RemoteResult<Option<Session>> {
        let builder = self.client.request(Method::GET, "/auth/session");
        match self.client.send(builder).await {
            Ok((_, body)) => Ok(parse_session(&body)),
            Err(err) if !err.is_transient() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn refresh_session(&self) -> RemoteResult<Option<Session>> {
        let builder = self.client.request(Method::POST, "/auth/refresh");
        match self.client.send(builder).await {
            Ok((_, body)) => Ok(parse_session(&body)),
            Err(err) if !err.is_transient() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn validate_user(&self) -> RemoteResult<Option<String>> {
        let builder = self.client.request(Method::GET, "/auth/user");
        match self.client.send(builder).await {
            Ok((_, body)) => {
                Ok(serde_json::from_str::<Option<UserDto>>(&body).ok().flatten().map(|u| u.id))
            }
            Err(err) if !err.is_transient() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn subscribe(
        &self,
        channel: &str,
        tables: &[String],
    ) -> RemoteResult<ChannelSubscription> {
        let url = websocket_url(self.client.base_url(), channel, tables)?;
        spawn_channel_task(url, self.client.egress()).await
    }
}

fn parse_session(body: &str) -> Option<Session> {
    serde_json::from_str::<Option<SessionDto>>(body)
        .ok()
        .flatten()
        .map(|dto| Session { user_id: dto.user_id, expires_at: dto.expires_at })
}

/// Filter value rendered the way the backend expects it in a query string.
fn filter_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn websocket_url(base_url: &str, channel: &str, tables: &[String]) -> RemoteResult<String> {
    let mut url = url::Url::parse(base_url)
        .map_err(|e| RemoteError::Config(format!("invalid base url: {e}")))?;

    let scheme = match url.scheme() {
        "https" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme)
        .map_err(|()| RemoteError::Config("unsupported base url scheme".to_string()))?;
    url.set_path(&format!("/realtime/{channel}"));
    url.query_pairs_mut().append_pair("tables", &tables.join(","));

    Ok(url.to_string())
}

fn urlencode(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::api::client::ApiClientConfig;

    async fn adapter(server: &MockServer) -> RestRemoteAdapter {
        let client =
            ApiClient::new(ApiClientConfig { base_url: server.uri(), bearer_token: None })
                .expect("client builds");
        RestRemoteAdapter::new(Arc::new(client))
    }

    #[tokio::test]
    async fn select_passes_cursor_and_order() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tasks"))
            .and(query_param("select", "*"))
            .and(query_param("order", "updated_at.asc,id.asc"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([{ "id": "e-1", "title": "x" }])),
            )
            .mount(&server)
            .await;

        let adapter = adapter(&server).await;
        let rows = adapter
            .select("tasks", "*", Some(Utc::now()), &[])
            .await
            .expect("select succeeds");

        assert_eq!(rows.len(), 1);
        assert_eq!(entity::id(&rows[0]), Some("e-1"));
    }

    #[tokio::test]
    async fn insert_empty_representation_reads_as_policy_refusal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tasks"))
            .and(header("prefer", "return=representation"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!([])))
            .mount(&server)
            .await;

        let adapter = adapter(&server).await;
        let mut row = Entity::new();
        row.insert("id".to_string(), json!("e-1"));

        let result = adapter.insert_returning_id("tasks", &row).await.expect("call succeeds");
        assert!(result.is_none(), "empty representation means silently refused");
    }

    #[tokio::test]
    async fn insert_conflict_maps_to_duplicate_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tasks"))
            .respond_with(ResponseTemplate::new(409).set_body_string("duplicate key"))
            .mount(&server)
            .await;

        let adapter = adapter(&server).await;
        let mut row = Entity::new();
        row.insert("id".to_string(), json!("e-1"));

        let result = adapter.insert_returning_id("tasks", &row).await;
        assert!(matches!(result, Err(RemoteError::DuplicateKey(_))));
    }

    #[tokio::test]
    async fn update_returns_id_from_representation() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/tasks"))
            .and(query_param("id", "eq.e-1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([{ "id": "e-1" }])),
            )
            .mount(&server)
            .await;

        let adapter = adapter(&server).await;
        let mut patch = Entity::new();
        patch.insert("title".to_string(), json!("y"));

        let result =
            adapter.update_returning_id("tasks", "e-1", &patch).await.expect("call succeeds");
        assert_eq!(result.as_deref(), Some("e-1"));
    }

    #[tokio::test]
    async fn session_parses_json_or_null() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "user_id": "u-1",
                "expires_at": null
            })))
            .mount(&server)
            .await;

        let adapter = adapter(&server).await;
        let session = adapter.session().await.expect("call succeeds");
        assert_eq!(session.map(|s| s.user_id).as_deref(), Some("u-1"));
    }

    #[tokio::test]
    async fn signed_out_user_is_none_not_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/user"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let adapter = adapter(&server).await;
        let user = adapter.validate_user().await.expect("call succeeds");
        assert!(user.is_none());
    }

    #[test]
    fn websocket_url_switches_scheme() {
        let url = websocket_url(
            "https://api.example.com",
            "tidemark:u-1",
            &["tasks".to_string(), "goals".to_string()],
        )
        .expect("url builds");

        assert!(url.starts_with("wss://api.example.com/realtime/tidemark:u-1"));
        assert!(url.contains("tables=tasks%2Cgoals"));
    }
}
