//! etcd v1 style key API over HTTP.
//!
//! - `GET /v1/keys/<path>` reads the local store (no consensus); a
//!   directory lists its immediate children
//! - `HEAD /v1/keys/<path>` is a GET without a body
//! - `PUT|POST /v1/keys/<path>` with `value`, `ttl`, `prevValue` sets or
//!   compare-and-swaps through dispatch
//! - `DELETE /v1/keys/<path>?recursive=true` deletes through dispatch
//!
//! Every response carries `X-Etcd-Index`, `X-Raft-Index` and `X-Raft-Term`,
//! observed together with the store state the body was built from.

use std::future::Future;

use axum::extract::{Form, Path, Query, State};
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::command::Command;
use crate::consensus::Consensus;
use crate::error::{Error, Result};
use crate::gateway::{Gateway, Stamp};
use crate::store::{Action, Event, NodeExtern};

pub const X_ETCD_INDEX: HeaderName = HeaderName::from_static("x-etcd-index");
pub const X_RAFT_INDEX: HeaderName = HeaderName::from_static("x-raft-index");
pub const X_RAFT_TERM: HeaderName = HeaderName::from_static("x-raft-term");

/// What the HTTP handlers need from a node.
pub trait Server: Clone + Send + Sync + 'static {
    /// Reads `path` non-recursively, unsorted, with the stamp observed
    /// alongside it.
    fn read(&self, path: &str) -> (Stamp, Result<Event>);
    fn stamp(&self) -> Stamp;
    fn now(&self) -> DateTime<Utc>;
    fn dispatch(&self, command: Command) -> impl Future<Output = Result<Event>> + Send;
}

impl<C: Consensus> Server for Gateway<C> {
    fn read(&self, path: &str) -> (Stamp, Result<Event>) {
        Gateway::read(self, path, false, false)
    }

    fn stamp(&self) -> Stamp {
        Gateway::stamp(self)
    }

    fn now(&self) -> DateTime<Utc> {
        Gateway::now(self)
    }

    fn dispatch(&self, command: Command) -> impl Future<Output = Result<Event>> + Send {
        Gateway::dispatch(self, command)
    }
}

/// One key in a v1 response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyResponse {
    pub action: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dir: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_value: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub new_key: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
    pub index: u64,
}

impl KeyResponse {
    /// Renders an event; `ttl` is computed against `now`.
    pub fn from_event(event: &Event, now: DateTime<Utc>) -> Self {
        match event.action {
            Action::Delete | Action::Expire => Self {
                action: event.action.as_str().to_string(),
                key: event.node.key.clone(),
                value: None,
                dir: event.node.dir,
                prev_value: event.node.value.clone(),
                new_key: false,
                expiration: None,
                ttl: None,
                index: event.index,
            },
            Action::Get | Action::Set | Action::CompareAndSwap => {
                let mut response = Self::from_node(event.action, &event.node, event.index, now);
                response.prev_value = event.prev_node.as_ref().and_then(|n| n.value.clone());
                response.new_key = event.is_new_key();
                response
            }
        }
    }

    fn from_node(action: Action, node: &NodeExtern, index: u64, now: DateTime<Utc>) -> Self {
        Self {
            action: action.as_str().to_string(),
            key: node.key.clone(),
            value: node.value.clone(),
            dir: node.dir,
            prev_value: None,
            new_key: false,
            expiration: node.expiration,
            ttl: node.ttl(now),
            index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error_code: u32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    pub index: u64,
}

#[derive(Debug, Default, Deserialize)]
struct WriteParams {
    value: Option<String>,
    ttl: Option<String>,
    #[serde(rename = "prevValue")]
    prev_value: Option<String>,
}

impl WriteParams {
    fn into_command(self, key: String, now: DateTime<Utc>) -> Result<Command> {
        let value = match self.value {
            Some(value) if !value.is_empty() => value,
            _ => return Err(Error::ValueRequired(key)),
        };
        let expiration = match self.ttl.as_deref() {
            None | Some("") => None,
            Some(raw) => {
                let seconds: i64 = raw.parse().map_err(|_| Error::InvalidTtl(raw.to_string()))?;
                if seconds <= 0 {
                    return Err(Error::InvalidTtl(raw.to_string()));
                }
                let expiration = chrono::Duration::try_seconds(seconds)
                    .and_then(|ttl| now.checked_add_signed(ttl))
                    .ok_or_else(|| Error::InvalidTtl(raw.to_string()))?;
                Some(expiration)
            }
        };
        Ok(match self.prev_value {
            Some(prev_value) if !prev_value.is_empty() => Command::CompareAndSwap {
                key,
                value,
                prev_value,
                expiration,
            },
            _ => Command::Set {
                key,
                value,
                expiration,
            },
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct DeleteParams {
    #[serde(default)]
    recursive: bool,
}

pub fn status_code(err: &Error) -> StatusCode {
    match err {
        Error::KeyNotFound(_) | Error::ExpirationSuperseded(_) => StatusCode::NOT_FOUND,
        Error::CompareFailed { .. } => StatusCode::PRECONDITION_FAILED,
        Error::NotAFile(_) | Error::DirectoryNotEmpty(_) => StatusCode::FORBIDDEN,
        Error::InvalidPath(_)
        | Error::InvalidTtl(_)
        | Error::ValueRequired(_)
        | Error::Codec(_)
        | Error::HistoryCleared { .. } => StatusCode::BAD_REQUEST,
        Error::NotLeader { .. } | Error::ProposalLost => StatusCode::SERVICE_UNAVAILABLE,
        Error::Timeout => StatusCode::GATEWAY_TIMEOUT,
        Error::Shutdown | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn router<S: Server>(server: S) -> Router {
    Router::new()
        .route("/v1/keys/", get(get_root::<S>).head(head_root::<S>))
        .route(
            "/v1/keys/*key",
            get(get_key::<S>)
                .head(head_key::<S>)
                .put(set_key::<S>)
                .post(set_key::<S>)
                .delete(delete_key::<S>),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(server)
}

async fn get_root<S: Server>(State(server): State<S>) -> Response {
    read(&server, "/", true)
}

async fn head_root<S: Server>(State(server): State<S>) -> Response {
    read(&server, "/", false)
}

async fn get_key<S: Server>(State(server): State<S>, Path(key): Path<String>) -> Response {
    read(&server, &format!("/{key}"), true)
}

async fn head_key<S: Server>(State(server): State<S>, Path(key): Path<String>) -> Response {
    read(&server, &format!("/{key}"), false)
}

async fn set_key<S: Server>(
    State(server): State<S>,
    Path(key): Path<String>,
    Form(params): Form<WriteParams>,
) -> Response {
    let command = match params.into_command(format!("/{key}"), server.now()) {
        Ok(command) => command,
        Err(err) => return error_response(server.stamp(), &err, true),
    };
    write(&server, command).await
}

async fn delete_key<S: Server>(
    State(server): State<S>,
    Path(key): Path<String>,
    Query(params): Query<DeleteParams>,
) -> Response {
    let command = Command::Delete {
        key: format!("/{key}"),
        recursive: params.recursive,
    };
    write(&server, command).await
}

/// A directory answers with the list of its children.
fn read<S: Server>(server: &S, path: &str, with_body: bool) -> Response {
    let (stamp, result) = server.read(path);
    let event = match result {
        Ok(event) => event,
        Err(err) => return error_response(stamp, &err, with_body),
    };
    if !with_body {
        return respond(stamp, StatusCode::OK, None::<KeyResponse>);
    }

    let now = server.now();
    if event.node.dir {
        let children: Vec<KeyResponse> = event
            .node
            .nodes
            .iter()
            .map(|child| KeyResponse::from_node(Action::Get, child, event.index, now))
            .collect();
        respond(stamp, StatusCode::OK, Some(children))
    } else {
        respond(stamp, StatusCode::OK, Some(KeyResponse::from_event(&event, now)))
    }
}

async fn write<S: Server>(server: &S, command: Command) -> Response {
    let result = server.dispatch(command).await;
    let stamp = server.stamp();
    match result {
        Ok(event) => respond(
            stamp,
            StatusCode::OK,
            Some(KeyResponse::from_event(&event, server.now())),
        ),
        Err(err) => error_response(stamp, &err, true),
    }
}

fn error_response(stamp: Stamp, err: &Error, with_body: bool) -> Response {
    let status = status_code(err);
    if status.is_server_error() {
        warn!(error = %err, "request failed");
    }
    let body = with_body.then(|| ErrorResponse {
        error_code: err.error_code(),
        message: err.message().to_string(),
        cause: err.cause(),
        index: stamp.index,
    });
    respond(stamp, status, body)
}

fn respond<T: Serialize>(stamp: Stamp, status: StatusCode, body: Option<T>) -> Response {
    let mut response = match body {
        Some(body) => (status, Json(body)).into_response(),
        None => status.into_response(),
    };
    let headers = response.headers_mut();
    headers.insert(X_ETCD_INDEX, HeaderValue::from(stamp.index));
    headers.insert(X_RAFT_INDEX, HeaderValue::from(stamp.commit_index));
    headers.insert(X_RAFT_TERM, HeaderValue::from(stamp.term));
    response
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::{Body, to_bytes};
    use axum::http::{HeaderMap, Method, Request};
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    use super::*;
    use crate::applier::Applier;
    use crate::clock::SystemClock;
    use crate::consensus::fake::FakeConsensus;
    use crate::store::{EventHistory, Store};

    fn gateway() -> Gateway<FakeConsensus> {
        let store = Store::shared();
        let history = Arc::new(EventHistory::new(64));
        let (tx, _rx) = mpsc::unbounded_channel();
        let consensus = FakeConsensus::new(Applier::new(1, store.clone(), history.clone(), tx));
        Gateway::new(
            consensus,
            store,
            history,
            Arc::new(SystemClock),
            Duration::from_secs(1),
        )
    }

    fn form(method: Method, uri: &str, body: impl Into<String>) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(body.into()))
            .unwrap()
    }

    fn empty(method: Method, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn send(server: &Gateway<FakeConsensus>, request: Request<Body>) -> (StatusCode, HeaderMap, Vec<u8>) {
        let response = router(server.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, body.to_vec())
    }

    #[tokio::test]
    async fn put_with_ttl_then_get() {
        let server = gateway();

        let (status, headers, body) =
            send(&server, form(Method::PUT, "/v1/keys/foo", "value=bar&ttl=100")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[&X_ETCD_INDEX], "1");
        assert_eq!(headers[&X_RAFT_TERM], "1");
        let set: KeyResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(set.action, "set");
        assert_eq!(set.key, "/foo");
        assert_eq!(set.value.as_deref(), Some("bar"));
        assert!(set.new_key);
        assert!(set.ttl.unwrap() >= 95);

        let (status, _, body) = send(&server, empty(Method::GET, "/v1/keys/foo")).await;
        assert_eq!(status, StatusCode::OK);
        let got: KeyResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(got.action, "get");
        assert_eq!(got.value.as_deref(), Some("bar"));
        assert_eq!(got.index, 1);
        assert!(got.ttl.unwrap() >= 95);
    }

    #[tokio::test]
    async fn missing_key_is_404_with_error_body() {
        let server = gateway();
        let (status, headers, body) = send(&server, empty(Method::GET, "/v1/keys/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(headers[&X_ETCD_INDEX], "0");

        let err: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(err.error_code, 100);
        assert_eq!(err.cause.as_deref(), Some("/nope"));
    }

    #[tokio::test]
    async fn head_has_status_and_no_body() {
        let server = gateway();
        server.set("/foo", "bar", None).await.unwrap();

        let (status, headers, body) = send(&server, empty(Method::HEAD, "/v1/keys/foo")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[&X_RAFT_INDEX], "1");
        assert!(body.is_empty());

        let (status, _, body) = send(&server, empty(Method::HEAD, "/v1/keys/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_and_set_reports_failure_as_412() {
        let server = gateway();
        server.set("/foo", "bar", None).await.unwrap();

        let (status, _, body) =
            send(&server, form(Method::POST, "/v1/keys/foo", "value=baz&prevValue=wrong")).await;
        assert_eq!(status, StatusCode::PRECONDITION_FAILED);
        let err: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(err.error_code, 101);
        assert_eq!(err.index, 2);

        let (status, _, body) =
            send(&server, form(Method::POST, "/v1/keys/foo", "value=baz&prevValue=bar")).await;
        assert_eq!(status, StatusCode::OK);
        let swapped: KeyResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(swapped.action, "testAndSet");
        assert_eq!(swapped.prev_value.as_deref(), Some("bar"));
        assert_eq!(swapped.index, 3);
    }

    #[tokio::test]
    async fn bad_form_values_are_400() {
        let server = gateway();

        let (status, _, body) = send(&server, form(Method::PUT, "/v1/keys/foo", "ttl=10")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let err: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(err.error_code, 200);

        let (status, _, body) =
            send(&server, form(Method::PUT, "/v1/keys/foo", "value=v&ttl=soon")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let err: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(err.error_code, 202);

        assert!(server.consensus().proposed().is_empty());
    }

    #[tokio::test]
    async fn ttl_beyond_the_calendar_is_400() {
        let server = gateway();

        for ttl in ["9000000000000", "9223372036854775807"] {
            let (status, _, body) =
                send(&server, form(Method::PUT, "/v1/keys/foo", format!("value=bar&ttl={ttl}"))).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            let err: ErrorResponse = serde_json::from_slice(&body).unwrap();
            assert_eq!(err.error_code, 202);
            assert_eq!(err.cause.as_deref(), Some(ttl));
        }

        assert!(server.consensus().proposed().is_empty());
        assert_eq!(server.stamp().index, 0);
    }

    #[tokio::test]
    async fn read_headers_match_the_body() {
        let server = gateway();
        server.set("/foo", "bar", None).await.unwrap();
        server.set("/other", "x", None).await.unwrap();

        let (status, headers, body) = send(&server, empty(Method::GET, "/v1/keys/foo")).await;
        assert_eq!(status, StatusCode::OK);
        let got: KeyResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(got.index, 2);
        assert_eq!(headers[&X_ETCD_INDEX], "2");
        assert_eq!(headers[&X_RAFT_INDEX], "2");
        assert_eq!(headers[&X_RAFT_TERM], "1");

        let (status, headers, body) = send(&server, empty(Method::GET, "/v1/keys/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let err: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(err.index, 2);
        assert_eq!(headers[&X_ETCD_INDEX], "2");
    }

    #[tokio::test]
    async fn delete_directory_needs_recursive() {
        let server = gateway();
        server.set("/dir/a", "1", None).await.unwrap();
        server.set("/dir/b", "2", None).await.unwrap();

        let (status, _, body) = send(&server, empty(Method::DELETE, "/v1/keys/dir")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let err: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(err.error_code, 108);

        let (status, _, body) =
            send(&server, empty(Method::DELETE, "/v1/keys/dir?recursive=true")).await;
        assert_eq!(status, StatusCode::OK);
        let deleted: KeyResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(deleted.action, "delete");
        assert_eq!(deleted.key, "/dir");
        assert!(deleted.dir);
        assert_eq!(deleted.index, 4);
    }

    #[tokio::test]
    async fn directory_lists_its_children() {
        let server = gateway();
        server.set("/dir/b", "2", None).await.unwrap();
        server.set("/dir/a", "1", None).await.unwrap();

        let (status, headers, body) = send(&server, empty(Method::GET, "/v1/keys/dir")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[&X_ETCD_INDEX], "2");
        let children: Vec<KeyResponse> = serde_json::from_slice(&body).unwrap();
        let mut keys: Vec<&str> = children.iter().map(|c| c.key.as_str()).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["/dir/a", "/dir/b"]);
        assert!(children.iter().all(|c| c.action == "get" && c.index == 2));
    }

    #[tokio::test]
    async fn follower_answers_503_with_leader_hint() {
        let server = gateway();
        server.consensus().set_leader(false);

        let (status, _, body) = send(&server, form(Method::PUT, "/v1/keys/foo", "value=bar")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let err: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(err.error_code, 301);
        assert_eq!(err.cause.as_deref(), Some("2"));
    }
}
