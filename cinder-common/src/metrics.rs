//! Process-wide Prometheus metrics plumbing: a bare `hyper` server
//! exposing a registry's `/metrics` page, spawned once at process
//! start.

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use prometheus::{Encoder, Registry, TextEncoder};
use std::convert::Infallible;
use std::net::SocketAddr;

pub struct MetricsManager;

impl MetricsManager {
    /// Spawns an HTTP server serving `registry` at `/metrics` and
    /// returns immediately; the server runs for the lifetime of the
    /// process (mirrors `MetricsManager::boot_metrics_service`).
    pub fn boot_metrics_service(addr: SocketAddr, registry: Registry) {
        let make_svc = make_service_fn(move |_conn| {
            let registry = registry.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let registry = registry.clone();
                    async move {
                        if req.uri().path() != "/metrics" {
                            return Ok::<_, Infallible>(
                                Response::builder()
                                    .status(404)
                                    .body(Body::from("not found"))
                                    .unwrap(),
                            );
                        }
                        let metric_families = registry.gather();
                        let mut buffer = Vec::new();
                        let encoder = TextEncoder::new();
                        encoder.encode(&metric_families, &mut buffer).unwrap();
                        Ok(Response::new(Body::from(buffer)))
                    }
                }))
            }
        });

        tokio::spawn(async move {
            if let Err(err) = Server::bind(&addr).serve(make_svc).await {
                tracing::error!(%err, "metrics server exited");
            }
        });
    }
}
