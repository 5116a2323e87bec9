use crate::infrastructure::error::InfraError;
use crate::infrastructure::remote_rows::{
    ChildRow, FamilyRows, RedemptionRow, RemoteRow, RemoteTable, RewardRow, TaskRow,
};
use crate::infrastructure::remote_store::{ProfileRow, RemoteStore};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;
use url::Url;

const PREFER_MINIMAL: &str = "return=minimal";
const PREFER_IGNORE_DUPLICATES: &str = "resolution=ignore-duplicates,return=representation";
const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTimeouts {
    pub read: Duration,
    pub write: Duration,
}

impl Default for RequestTimeouts {
    fn default() -> Self {
        Self {
            read: Duration::from_millis(8_000),
            write: Duration::from_millis(10_000),
        }
    }
}

/// PostgREST-style client over `/rest/v1/{table}`.
#[derive(Debug, Clone)]
pub struct ReqwestRemoteStore {
    client: Client,
    base_url: Url,
    api_key: String,
    access_token: Option<String>,
    timeouts: RequestTimeouts,
}

impl ReqwestRemoteStore {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, InfraError> {
        let base_url = Url::parse(base_url.trim())
            .map_err(|error| InfraError::InvalidConfig(format!("invalid remote rest url: {error}")))?;
        if base_url.cannot_be_a_base() {
            return Err(InfraError::InvalidConfig(
                "remote rest url cannot be a base".to_string(),
            ));
        }
        if api_key.trim().is_empty() {
            return Err(InfraError::InvalidConfig(
                "remote api key must not be empty".to_string(),
            ));
        }
        Ok(Self {
            client: Client::new(),
            base_url,
            api_key: api_key.trim().to_string(),
            access_token: None,
            timeouts: RequestTimeouts::default(),
        })
    }

    pub fn with_access_token(mut self, access_token: impl Into<String>) -> Self {
        self.access_token = Some(access_token.into()).filter(|token| !token.trim().is_empty());
        self
    }

    pub fn with_timeouts(mut self, timeouts: RequestTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    fn table_endpoint(&self, table: RemoteTable) -> Result<Url, InfraError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                InfraError::InvalidConfig("remote rest url cannot be a base".to_string())
            })?;
            segments.pop_if_empty();
            segments.push("rest");
            segments.push("v1");
            segments.push(table.as_str());
        }
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let bearer = self.access_token.as_deref().unwrap_or(&self.api_key);
        request.header("apikey", &self.api_key).bearer_auth(bearer)
    }

    async fn read_rows<T: DeserializeOwned>(
        &self,
        table: RemoteTable,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, InfraError> {
        let endpoint = self.table_endpoint(table)?;
        let response = self
            .authorize(self.client.get(endpoint))
            .query(query)
            .timeout(self.timeouts.read)
            .send()
            .await
            .map_err(|error| request_error(error, &format!("reading {}", table.as_str())))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| request_error(error, &format!("reading {} response", table.as_str())))?;

        if is_refused_read(status) {
            debug!(
                "read of {} refused with http {}; treating as empty",
                table.as_str(),
                status.as_u16()
            );
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(http_error(status, &body));
        }

        serde_json::from_str(&body).map_err(|error| {
            InfraError::Mapping(format!("invalid {} payload: {error}; body={body}", table.as_str()))
        })
    }

    async fn read_family_dependents<T: DeserializeOwned>(
        &self,
        table: RemoteTable,
        child_filter: &str,
    ) -> Result<Vec<T>, InfraError> {
        self.read_rows(
            table,
            &[("select", "*".to_string()), ("child_id", child_filter.to_string())],
        )
        .await
    }
}

fn eq_filter(value: &str) -> String {
    format!("eq.{value}")
}

fn in_filter(values: &[String]) -> String {
    let quoted = values
        .iter()
        .map(|value| format!("\"{}\"", value.replace('"', "")))
        .collect::<Vec<_>>()
        .join(",");
    format!("in.({quoted})")
}

fn is_refused_read(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND
    )
}

fn request_error(error: reqwest::Error, action: &str) -> InfraError {
    if error.is_timeout() {
        InfraError::Timeout(format!("{action}: {error}"))
    } else {
        InfraError::Network(format!("network error while {action}: {error}"))
    }
}

fn http_error(status: StatusCode, body: &str) -> InfraError {
    let message = if body.trim().is_empty() {
        format!("remote store error: http {}", status.as_u16())
    } else {
        format!("remote store error: http {}; body={body}", status.as_u16())
    };
    InfraError::RemoteStatus {
        status: status.as_u16(),
        message,
    }
}

fn is_duplicate(status: StatusCode, body: &str) -> bool {
    status == StatusCode::CONFLICT || body.contains(UNIQUE_VIOLATION)
}

#[derive(Debug, serde::Deserialize)]
struct IdOnly {
    id: String,
}

#[async_trait]
impl RemoteStore for ReqwestRemoteStore {
    async fn exists(&self, table: RemoteTable, id: &str) -> Result<bool, InfraError> {
        let rows: Vec<IdOnly> = self
            .read_rows(
                table,
                &[("select", "id".to_string()), ("id", eq_filter(id))],
            )
            .await?;
        Ok(rows.iter().any(|row| row.id == id))
    }

    async fn insert(&self, row: &RemoteRow) -> Result<(), InfraError> {
        let table = row.table();
        let endpoint = self.table_endpoint(table)?;
        let response = self
            .authorize(self.client.post(endpoint))
            .header("Prefer", PREFER_MINIMAL)
            .json(&[row.to_json()?])
            .timeout(self.timeouts.write)
            .send()
            .await
            .map_err(|error| request_error(error, &format!("inserting into {}", table.as_str())))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| request_error(error, &format!("reading {} insert response", table.as_str())))?;

        if status.is_success() {
            return Ok(());
        }
        if is_duplicate(status, &body) {
            return Err(InfraError::Duplicate {
                table: table.as_str().to_string(),
                id: row.id().to_string(),
            });
        }
        Err(http_error(status, &body))
    }

    async fn update(&self, row: &RemoteRow) -> Result<(), InfraError> {
        let table = row.table();
        let endpoint = self.table_endpoint(table)?;
        let response = self
            .authorize(self.client.patch(endpoint))
            .query(&[("id", eq_filter(row.id()))])
            .header("Prefer", PREFER_MINIMAL)
            .json(&row.to_json()?)
            .timeout(self.timeouts.write)
            .send()
            .await
            .map_err(|error| request_error(error, &format!("updating {}", table.as_str())))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| request_error(error, &format!("reading {} update response", table.as_str())))?;

        if !status.is_success() {
            return Err(http_error(status, &body));
        }
        Ok(())
    }

    async fn delete(&self, table: RemoteTable, id: &str) -> Result<(), InfraError> {
        let endpoint = self.table_endpoint(table)?;
        let response = self
            .authorize(self.client.delete(endpoint))
            .query(&[("id", eq_filter(id))])
            .timeout(self.timeouts.write)
            .send()
            .await
            .map_err(|error| request_error(error, &format!("deleting from {}", table.as_str())))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| request_error(error, &format!("reading {} delete response", table.as_str())))?;

        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(http_error(status, &body))
    }

    async fn insert_ignoring_duplicates(
        &self,
        table: RemoteTable,
        rows: &[RemoteRow],
    ) -> Result<Vec<String>, InfraError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let payload = rows
            .iter()
            .map(RemoteRow::to_json)
            .collect::<Result<Vec<_>, _>>()?;

        let endpoint = self.table_endpoint(table)?;
        let response = self
            .authorize(self.client.post(endpoint))
            .query(&[("on_conflict", "id")])
            .header("Prefer", PREFER_IGNORE_DUPLICATES)
            .json(&payload)
            .timeout(self.timeouts.write)
            .send()
            .await
            .map_err(|error| request_error(error, &format!("batch inserting into {}", table.as_str())))?;

        let status = response.status();
        let body = response.text().await.map_err(|error| {
            request_error(error, &format!("reading {} batch response", table.as_str()))
        })?;

        if !status.is_success() {
            return Err(http_error(status, &body));
        }
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }
        let inserted: Vec<IdOnly> = serde_json::from_str(&body).map_err(|error| {
            InfraError::Mapping(format!("invalid {} batch payload: {error}", table.as_str()))
        })?;
        Ok(inserted.into_iter().map(|row| row.id).collect())
    }

    async fn fetch_family(&self, family_id: &str) -> Result<FamilyRows, InfraError> {
        let children: Vec<ChildRow> = self
            .read_rows(
                RemoteTable::Children,
                &[
                    ("select", "*".to_string()),
                    ("family_id", eq_filter(family_id)),
                    ("order", "created_at.asc".to_string()),
                ],
            )
            .await?;
        if children.is_empty() {
            return Ok(FamilyRows::default());
        }

        let child_ids = children.iter().map(|child| child.id.clone()).collect::<Vec<_>>();
        let child_filter = in_filter(&child_ids);
        let tasks: Vec<TaskRow> = self
            .read_family_dependents(RemoteTable::Tasks, &child_filter)
            .await?;
        let rewards: Vec<RewardRow> = self
            .read_family_dependents(RemoteTable::Rewards, &child_filter)
            .await?;
        let redemptions: Vec<RedemptionRow> = self
            .read_family_dependents(RemoteTable::RedemptionHistory, &child_filter)
            .await?;

        Ok(FamilyRows {
            children,
            tasks,
            rewards,
            redemptions,
        })
    }

    async fn fetch_profile(&self, user_id: &str) -> Result<Option<ProfileRow>, InfraError> {
        let profiles: Vec<ProfileRow> = self
            .read_rows(
                RemoteTable::Profiles,
                &[
                    ("select", "id,family_id,display_name".to_string()),
                    ("id", eq_filter(user_id)),
                ],
            )
            .await?;
        Ok(profiles.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_endpoint_appends_rest_path() {
        let store = ReqwestRemoteStore::new("https://family.example.com/", "anon-key")
            .expect("valid store");
        assert_eq!(
            store
                .table_endpoint(RemoteTable::RedemptionHistory)
                .expect("endpoint")
                .as_str(),
            "https://family.example.com/rest/v1/redemption_history"
        );
    }

    #[test]
    fn new_rejects_bad_configuration() {
        assert!(matches!(
            ReqwestRemoteStore::new("not a url", "key"),
            Err(InfraError::InvalidConfig(_))
        ));
        assert!(matches!(
            ReqwestRemoteStore::new("https://family.example.com", "  "),
            Err(InfraError::InvalidConfig(_))
        ));
    }

    #[test]
    fn filters_use_postgrest_operators() {
        assert_eq!(eq_filter("kid-1"), "eq.kid-1");
        assert_eq!(
            in_filter(&["kid-1".to_string(), "kid-2".to_string()]),
            "in.(\"kid-1\",\"kid-2\")"
        );
    }

    #[test]
    fn status_classification() {
        assert!(is_refused_read(StatusCode::FORBIDDEN));
        assert!(!is_refused_read(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_duplicate(StatusCode::CONFLICT, ""));
        assert!(is_duplicate(
            StatusCode::BAD_REQUEST,
            r#"{"code":"23505","message":"duplicate key value"}"#
        ));
        assert!(http_error(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(!http_error(StatusCode::BAD_REQUEST, "bad").is_transient());
    }
}
