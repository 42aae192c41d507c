//! HTTP server for the cluster metadata service.
//!
//! The server is a thin surface over [`meta_store::Store`]: commands are
//! proposed through `/execute`, consumers long-poll `/snapshot` for data
//! changes, and `/join`, `/lease`, `/ping` handle membership, advisory
//! leases, and liveness.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod config;
mod http;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use observability_deps::tracing::info;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::http::route_request;

pub use crate::config::MetaConfig;
pub use crate::http::{HttpApi, DEFAULT_SNAPSHOT_WAIT};

#[derive(Debug, Error)]
pub enum Error {
    #[error("hyper error: {0}")]
    Hyper(#[from] hyper::Error),

    #[error("invalid bind address {addr}: {source}")]
    InvalidBindAddress {
        addr: String,
        source: std::net::AddrParseError,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One meta node's HTTP frontend.
#[derive(Debug)]
pub struct MetaServer {
    http_addr: SocketAddr,
    api: Arc<HttpApi>,
}

impl MetaServer {
    pub fn new(store: Arc<meta_store::Store>, config: &MetaConfig) -> Result<Self> {
        let http_addr =
            config
                .bind_address
                .parse()
                .map_err(|source| Error::InvalidBindAddress {
                    addr: config.bind_address.clone(),
                    source,
                })?;
        Ok(Self {
            http_addr,
            api: Arc::new(HttpApi::new(store, config.tls)),
        })
    }

    /// Build a server from parts, for callers that already hold an API.
    pub fn from_parts(http_addr: SocketAddr, api: HttpApi) -> Self {
        Self {
            http_addr,
            api: Arc::new(api),
        }
    }
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(server: MetaServer, shutdown: CancellationToken) -> Result<()> {
    let api = Arc::clone(&server.api);
    let make_service = make_service_fn(move |_| {
        let api = Arc::clone(&api);
        let service = service_fn(move |req: hyper::Request<hyper::Body>| {
            route_request(Arc::clone(&api), req)
        });
        futures::future::ready(Ok::<_, Infallible>(service))
    });

    info!(addr = %server.http_addr, "meta service listening");
    hyper::Server::bind(&server.http_addr)
        .serve(make_service)
        .with_graceful_shutdown(shutdown.cancelled())
        .await?;

    Ok(())
}
