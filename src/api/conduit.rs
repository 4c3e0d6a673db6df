//! Thin blocking HTTP transport for a conduit-style review service API.
//!
//! Calls are `POST <instance>/api/<method>` with the API token and a JSON
//! parameter object form-encoded the way conduit expects. Responses carry
//! `{"result": ..., "error_code": ..., "error_info": ...}`.

use std::time::Duration;

use error_stack::{report, Result};
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

use crate::api::review::{
    CreateReview, Error, ReviewClient, ReviewId, ReviewInfo, ReviewStatus, UserDirectory, UserId,
    UserRecord,
};
use crate::ext::error_stack::{DescribeContext, ErrorHelper, IntoContext};
use crate::ext::result::WrapErr;

/// The conduit API client.
pub struct ConduitClient {
    http: reqwest::blocking::Client,
    instance: Url,
    token: Secret<String>,
}

impl std::fmt::Debug for ConduitClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConduitClient")
            .field("instance", &self.instance.as_str())
            .field("token", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct ConduitResponse {
    result: Option<Value>,
    error_code: Option<String>,
    error_info: Option<String>,
}

impl ConduitClient {
    /// Construct a client for the service at `instance`.
    pub fn new(instance: Url, token: Secret<String>) -> Result<Self, Error> {
        reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context(Error::Transport)
            .describe("construct http client for the review service")
            .map(|http| Self {
                http,
                instance,
                token,
            })
    }

    fn call(&self, method: &str, params: Value) -> Result<Value, Error> {
        let endpoint = self
            .instance
            .join(&format!("api/{method}"))
            .context(Error::Transport)
            .describe_lazy(|| format!("build endpoint for conduit method '{method}'"))?;

        let mut params = params;
        params["__conduit__"] = json!({ "token": self.token.expose_secret() });
        let body = serde_json::to_string(&params).context(Error::Transport)?;

        let response = self
            .http
            .post(endpoint)
            .form(&[("params", body.as_str()), ("output", "json")])
            .send()
            .context(Error::Transport)
            .describe_lazy(|| format!("call conduit method '{method}'"))?;

        let status = response.status();
        if !status.is_success() {
            return report!(Error::Transport)
                .wrap_err()
                .describe_lazy(|| format!("conduit method '{method}' returned HTTP {status}"));
        }

        let parsed: ConduitResponse = response
            .json()
            .context(Error::Transport)
            .describe_lazy(|| format!("parse response of conduit method '{method}'"))?;

        match (parsed.error_code, parsed.result) {
            (Some(code), _) => {
                let info = parsed.error_info.unwrap_or_default();
                // Unknown-user failures are load-bearing for the identity
                // cache's isolation policy, so decode them specially.
                if code == "ERR-INVALID-USER" {
                    let names = info
                        .split(|c: char| !c.is_alphanumeric() && c != '_' && c != '-')
                        .filter(|s| !s.is_empty())
                        .map(str::to_owned)
                        .collect();
                    report!(Error::UnknownUsernames(names)).wrap_err()
                } else {
                    report!(Error::Api(format!("{code}: {info}"))).wrap_err()
                }
            }
            (None, Some(result)) => Ok(result),
            (None, None) => report!(Error::Api("empty response".to_owned()))
                .wrap_err()
                .describe_lazy(|| format!("conduit method '{method}'")),
        }
    }

    fn field_u64(value: &Value, field: &str) -> Result<u64, Error> {
        let raw = &value[field];
        raw.as_u64()
            .or_else(|| raw.as_str().and_then(|s| s.parse().ok()))
            .ok_or_else(|| report!(Error::Api(format!("missing numeric field '{field}'"))))
            .describe_lazy(|| format!("in response value: {value}"))
    }
}

fn status_from_wire(name: &str) -> Result<ReviewStatus, Error> {
    name.parse::<ReviewStatus>()
        .ok()
        .ok_or_else(|| report!(Error::Api(format!("unknown review status '{name}'"))))
}

impl ReviewClient for ConduitClient {
    fn create_review(&self, fields: &CreateReview) -> Result<ReviewId, Error> {
        let result = self.call(
            "differential.createrevision",
            json!({
                "title": fields.title,
                "summary": fields.summary,
                "testPlan": fields.test_plan,
                "reviewerPHIDs": fields.reviewers.iter().map(|r| &r.0).collect::<Vec<_>>(),
                "diff": fields.diff,
            }),
        )?;
        Self::field_u64(&result, "revisionid")
    }

    fn update_diff(&self, id: ReviewId, diff: &str, message: &str) -> Result<(), Error> {
        self.call(
            "differential.updaterevision",
            json!({ "id": id, "diff": diff, "message": message }),
        )
        .map(|_| ())
    }

    fn comment(&self, id: ReviewId, body: &str) -> Result<(), Error> {
        self.call(
            "differential.createcomment",
            json!({ "revision_id": id, "message": body }),
        )
        .map(|_| ())
    }

    fn close(&self, id: ReviewId) -> Result<(), Error> {
        self.call("differential.close", json!({ "revisionID": id }))
            .map(|_| ())
    }

    fn abandon(&self, id: ReviewId) -> Result<(), Error> {
        self.call(
            "differential.createcomment",
            json!({ "revision_id": id, "message": "", "action": "abandon" }),
        )
        .map(|_| ())
    }

    fn query(&self, id: ReviewId) -> Result<ReviewInfo, Error> {
        let result = self.call("differential.query", json!({ "ids": [id] }))?;
        let entry = result
            .as_array()
            .and_then(|rows| rows.first())
            .ok_or_else(|| report!(Error::NoSuchReview(id)))?;

        let status_name = entry["statusName"]
            .as_str()
            .map(|s| s.to_lowercase().replace(' ', "_"))
            .ok_or_else(|| report!(Error::Api("missing statusName".to_owned())))?;

        Ok(ReviewInfo {
            id,
            status: status_from_wire(&status_name)?,
            title: entry["title"].as_str().unwrap_or_default().to_owned(),
            summary: entry["summary"].as_str().unwrap_or_default().to_owned(),
            reviewers: entry["reviewers"]
                .as_array()
                .map(|rows| {
                    rows.iter()
                        .filter_map(|r| r.as_str().map(str::to_owned))
                        .collect()
                })
                .unwrap_or_default(),
            uri: entry["uri"].as_str().map(str::to_owned),
        })
    }

    fn query_statuses(&self, ids: &[ReviewId]) -> Result<Vec<(ReviewId, ReviewStatus)>, Error> {
        let result = self.call("differential.query", json!({ "ids": ids }))?;
        let rows = result
            .as_array()
            .ok_or_else(|| report!(Error::Api("expected a result list".to_owned())))?;

        let mut statuses = Vec::with_capacity(rows.len());
        for entry in rows {
            let id = Self::field_u64(entry, "id")?;
            let status_name = entry["statusName"]
                .as_str()
                .map(|s| s.to_lowercase().replace(' ', "_"))
                .ok_or_else(|| report!(Error::Api("missing statusName".to_owned())))?;
            statuses.push((id, status_from_wire(&status_name)?));
        }
        Ok(statuses)
    }
}

fn users_from_result(result: Value) -> Result<Vec<UserRecord>, Error> {
    let rows = result
        .as_array()
        .ok_or_else(|| report!(Error::Api("expected a user list".to_owned())))?;
    let mut users = Vec::with_capacity(rows.len());
    for entry in rows {
        let username = entry["userName"]
            .as_str()
            .ok_or_else(|| report!(Error::Api("missing userName".to_owned())))?
            .to_owned();
        let id = entry["phid"]
            .as_str()
            .ok_or_else(|| report!(Error::Api("missing phid".to_owned())))?
            .to_owned();
        users.push(UserRecord {
            username,
            id: UserId(id),
            email: entry["primaryEmail"].as_str().map(str::to_owned),
        });
    }
    Ok(users)
}

impl UserDirectory for ConduitClient {
    fn query_users_by_name(&self, usernames: &[String]) -> Result<Vec<UserRecord>, Error> {
        self.call("user.query", json!({ "usernames": usernames }))
            .and_then(users_from_result)
            .help_lazy(|| {
                format!(
                    "check the reviewer names mentioned in the commit message: {}",
                    usernames.join(", ")
                )
            })
    }

    fn query_users_by_id(&self, ids: &[UserId]) -> Result<Vec<UserRecord>, Error> {
        let ids: Vec<&str> = ids.iter().map(|id| id.0.as_str()).collect();
        self.call("user.query", json!({ "phids": ids }))
            .and_then(users_from_result)
    }

    fn query_users_by_email(&self, emails: &[String]) -> Result<Vec<UserRecord>, Error> {
        self.call("user.query", json!({ "emails": emails }))
            .and_then(users_from_result)
    }
}
