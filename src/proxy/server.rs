use anyhow::Result;
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use super::engine::ProxyEngine;
use crate::admin::{self, AdminContext};
use crate::shutdown::Shutdown;

/// The single listener serving both surfaces: the registry v2 protocol
/// for clients and the JSON admin API under its base path.
pub struct ProxyServer {
    bind_addr: SocketAddr,
    engine: ProxyEngine,
    admin: Arc<AdminContext>,
    admin_base_path: String,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        engine: ProxyEngine,
        admin: Arc<AdminContext>,
        admin_base_path: String,
    ) -> Self {
        Self {
            bind_addr,
            engine,
            admin,
            admin_base_path,
        }
    }

    pub async fn run(self, shutdown: Shutdown) -> Result<()> {
        let engine = self.engine.clone();
        let admin = Arc::clone(&self.admin);
        let base_path = self.admin_base_path.clone();

        let make_service = make_service_fn(move |conn: &AddrStream| {
            let engine = engine.clone();
            let admin = Arc::clone(&admin);
            let base_path = base_path.clone();
            let remote = conn.remote_addr();
            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let engine = engine.clone();
                    let admin = Arc::clone(&admin);
                    let base_path = base_path.clone();
                    async move { Ok::<_, Infallible>(dispatch(req, remote, engine, admin, &base_path).await) }
                }))
            }
        });

        let server = Server::try_bind(&self.bind_addr)
            .map_err(|e| anyhow::anyhow!("failed to bind {}: {}", self.bind_addr, e))?
            .serve(make_service);
        info!("Proxy listening on {}", self.bind_addr);

        let mut shutdown_rx = shutdown.subscribe();
        server
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("Proxy server draining connections");
            })
            .await?;
        Ok(())
    }
}

async fn dispatch(
    req: Request<Body>,
    remote: SocketAddr,
    engine: ProxyEngine,
    admin: Arc<AdminContext>,
    admin_base_path: &str,
) -> Response<Body> {
    let path = req.uri().path();
    if path == admin_base_path || path.starts_with(&format!("{}/", admin_base_path)) {
        admin::handle(req, admin, admin_base_path).await
    } else {
        engine.handle(req, remote).await
    }
}
