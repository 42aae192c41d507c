//! HTTP API service implementation for the meta service.
//!
//! Three families of endpoints: `/execute` proposes a command, `/snapshot`
//! long-polls for data newer than a given index, and `/join`, `/lease`,
//! `/ping` handle membership, advisory leases, and liveness. Everything that
//! needs leadership answers followers with a 307 pointing at the leader.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use hyper::header::{CONTENT_TYPE, LOCATION};
use hyper::{Body, Method, Request, Response, StatusCode};
use observability_deps::tracing::{debug, error, warn};
use prost::Message;
use serde::Deserialize;
use thiserror::Error;

use meta_store::{LeaseContested, Leases, Store, StoreError};
use meta_types::NodeInfo;

/// How long a `/snapshot` long-poll may block before the current data is
/// returned regardless.
pub const DEFAULT_SNAPSHOT_WAIT: Duration = Duration::from_secs(30);

const OCTET_STREAM: &str = "application/octet-stream";
const APPLICATION_JSON: &str = "application/json";

#[derive(Debug, Error)]
pub enum Error {
    /// The requested path has no registered handler.
    #[error("not found")]
    NoHandler,

    /// The request body is not a decodable command.
    #[error("invalid command: {0}")]
    DecodeCommand(prost::DecodeError),

    /// The join body is not valid JSON.
    #[error("invalid join body: {0}")]
    InvalidJoinBody(serde_json::Error),

    /// Query string deserialization failed.
    #[error("invalid query parameters: {0}")]
    QueryParams(#[from] serde_urlencoded::de::Error),

    /// `/lease` needs both `name` and `nodeid`.
    #[error("missing required parameters 'name' and 'nodeid'")]
    MissingLeaseParams,

    /// No leader is available to serve the request.
    #[error("meta service unavailable")]
    Unavailable,

    /// The lease is held by another node.
    #[error("another node has the lease")]
    LeaseContested(LeaseContested),

    /// A peer failed the all-nodes liveness check.
    #[error("meta node {host} is unreachable")]
    PeerUnreachable { host: String },

    /// The client disconnected mid-body.
    #[error("reading request body: {0}")]
    ReadBody(hyper::Error),

    #[error("http error: {0}")]
    Http(#[from] hyper::http::Error),

    #[error("store error: {0}")]
    Store(String),
}

impl Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::NoHandler => StatusCode::NOT_FOUND,
            Self::DecodeCommand(_)
            | Self::InvalidJoinBody(_)
            | Self::QueryParams(_)
            | Self::MissingLeaseParams => StatusCode::BAD_REQUEST,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::LeaseContested(_) => StatusCode::CONFLICT,
            Self::PeerUnreachable { .. } | Self::ReadBody(_) | Self::Http(_) | Self::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn response(&self) -> Response<Body> {
        let body = serde_json::json!({ "error": self.to_string() }).to_string();
        Response::builder()
            .status(self.status_code())
            .header(CONTENT_TYPE, APPLICATION_JSON)
            .body(Body::from(body))
            .expect("constructing error response is infallible")
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Shared state behind the HTTP handlers.
#[derive(Debug)]
pub struct HttpApi {
    store: Arc<Store>,
    leases: Leases,
    snapshot_wait: Duration,
    https: bool,
}

impl HttpApi {
    pub fn new(store: Arc<Store>, https: bool) -> Self {
        Self {
            store,
            leases: Leases::default(),
            snapshot_wait: DEFAULT_SNAPSHOT_WAIT,
            https,
        }
    }

    /// Override the `/snapshot` wait cap (tests).
    pub fn with_snapshot_wait(mut self, snapshot_wait: Duration) -> Self {
        self.snapshot_wait = snapshot_wait;
        self
    }

    fn scheme(&self) -> &'static str {
        if self.https {
            "https"
        } else {
            "http"
        }
    }

    fn redirect(&self, leader: &str, path: &str) -> Result<Response<Body>> {
        Ok(Response::builder()
            .status(StatusCode::TEMPORARY_REDIRECT)
            .header(LOCATION, format!("{}://{}{}", self.scheme(), leader, path))
            .body(Body::empty())?)
    }

    /// POST `/execute`: propose a marshaled command.
    ///
    /// Command-level failures still answer 200; the error travels in the
    /// response envelope. Followers answer 307 toward the leader.
    async fn execute(&self, req: Request<Body>) -> Result<Response<Body>> {
        let body = hyper::body::to_bytes(req.into_body())
            .await
            .map_err(Error::ReadBody)?;
        let cmd = meta_proto::Command::decode(body).map_err(Error::DecodeCommand)?;

        match self.store.propose(&cmd).await {
            Ok(response) => Ok(Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, OCTET_STREAM)
                .body(Body::from(meta_proto::encode(&response)))?),
            Err(StoreError::Redirect { location }) => self.redirect(&location, "/execute"),
            Err(StoreError::Unavailable) => Err(Error::Unavailable),
            Err(e) => Err(Error::Store(e.to_string())),
        }
    }

    /// GET `/snapshot?index=N`: long-poll for data at an index greater than
    /// `N`, capped at the configured wait.
    async fn snapshot(&self, req: Request<Body>) -> Result<Response<Body>> {
        #[derive(Debug, Deserialize)]
        struct SnapshotParams {
            #[serde(default)]
            index: u64,
        }

        let params: SnapshotParams =
            serde_urlencoded::from_str(req.uri().query().unwrap_or_default())?;
        let data = self
            .store
            .snapshot_after(params.index, self.snapshot_wait)
            .await;

        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, OCTET_STREAM)
            .body(Body::from(data.marshal_binary()))?)
    }

    /// POST `/join`: leader appends a voter.
    async fn join(&self, req: Request<Body>) -> Result<Response<Body>> {
        let body = hyper::body::to_bytes(req.into_body())
            .await
            .map_err(Error::ReadBody)?;
        let node: NodeInfo = serde_json::from_slice(&body).map_err(Error::InvalidJoinBody)?;

        match self.store.join(&node.host, &node.tcp_host) {
            Ok(node) => Ok(Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, APPLICATION_JSON)
                .body(Body::from(
                    serde_json::to_string(&node).expect("node info serializes"),
                ))?),
            Err(StoreError::Redirect { location }) => self.redirect(&location, "/join"),
            Err(StoreError::Unavailable) | Err(StoreError::NotLeader) => Err(Error::Unavailable),
            Err(e) => Err(Error::Store(e.to_string())),
        }
    }

    /// GET `/lease?name=N&nodeid=I`: grant or renew an advisory lease.
    /// Leases are leader-local, so followers answer 503.
    async fn lease(&self, req: Request<Body>) -> Result<Response<Body>> {
        #[derive(Debug, Deserialize)]
        struct LeaseParams {
            name: Option<String>,
            nodeid: Option<u64>,
        }

        let params: LeaseParams =
            serde_urlencoded::from_str(req.uri().query().unwrap_or_default())?;
        let (name, node_id) = match (params.name, params.nodeid) {
            (Some(name), Some(node_id)) if !name.is_empty() => (name, node_id),
            _ => return Err(Error::MissingLeaseParams),
        };

        if !self.store.is_leader() {
            return Err(Error::Unavailable);
        }

        let lease = self
            .leases
            .acquire(&name, node_id)
            .map_err(Error::LeaseContested)?;
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, APPLICATION_JSON)
            .body(Body::from(
                serde_json::to_string(&lease).expect("lease serializes"),
            ))?)
    }

    /// GET `/ping[?all=true]`: liveness. With `all=true` the leader checks
    /// that every meta node answers.
    async fn ping(&self, req: Request<Body>) -> Result<Response<Body>> {
        #[derive(Debug, Deserialize)]
        struct PingParams {
            #[serde(default)]
            all: bool,
        }

        let params: PingParams =
            serde_urlencoded::from_str(req.uri().query().unwrap_or_default())?;

        if params.all {
            self.ping_peers().await?;
        }

        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, APPLICATION_JSON)
            .body(Body::from(r#"{"status":"ok"}"#))?)
    }

    async fn ping_peers(&self) -> Result<()> {
        let data = self.store.data();
        let client = hyper::Client::new();

        for node in &data.meta_nodes {
            if node.host == self.store.http_addr() {
                continue;
            }
            let uri = format!("{}://{}/ping", self.scheme(), node.host);
            let reachable = match tokio::time::timeout(
                Duration::from_secs(5),
                client.get(uri.parse().map_err(|_| Error::PeerUnreachable {
                    host: node.host.clone(),
                })?),
            )
            .await
            {
                Ok(Ok(resp)) => resp.status() == StatusCode::OK,
                _ => false,
            };

            if !reachable {
                warn!(host = %node.host, "meta node failed liveness check");
                return Err(Error::PeerUnreachable {
                    host: node.host.clone(),
                });
            }
        }
        Ok(())
    }
}

pub(crate) async fn route_request(
    api: Arc<HttpApi>,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let uri = req.uri().clone();

    let response = match (method.clone(), uri.path()) {
        (Method::POST, "/execute") => api.execute(req).await,
        (Method::GET, "/snapshot") => api.snapshot(req).await,
        (Method::POST, "/join") => api.join(req).await,
        (Method::GET, "/lease") => api.lease(req).await,
        (Method::GET, "/ping") => api.ping(req).await,
        _ => Err(Error::NoHandler),
    };

    match response {
        Ok(response) => {
            debug!(status = %response.status(), %method, %uri, "processed request");
            Ok(response)
        }
        Err(e) => {
            // 4xx-class rejections are the caller's problem, log them softly
            if e.status_code().is_server_error() {
                error!(%e, %method, %uri, "error handling request");
            } else {
                debug!(%e, %method, %uri, "request rejected");
            }
            Ok(e.response())
        }
    }
}
