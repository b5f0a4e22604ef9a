//! HTTP endpoint exposing the latest aggregate.
//!
//! `GET /` returns the current head and totals in the checkpoint wire shape
//! (without the `file` marker); `GET /health` answers liveness probes.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::checkpoint::TotalSupply;
use crate::tracker::SupplyTracker;

/// Serve the state API on `port` until the listener fails.
pub async fn serve(port: u16, tracker: Arc<RwLock<SupplyTracker>>) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("API server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let tracker = tracker.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| handle_request(req, tracker.clone()));
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                error!("Error serving connection: {:?}", err);
            }
        });
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    tracker: Arc<RwLock<SupplyTracker>>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/") => supply_response(&tracker),
        (&Method::GET, "/health") => json_response(StatusCode::OK, r#"{"status":"ok"}"#.into()),
        _ => json_response(StatusCode::NOT_FOUND, r#"{"error":"not found"}"#.into()),
    };
    Ok(response)
}

fn supply_response(tracker: &Arc<RwLock<SupplyTracker>>) -> Response<Full<Bytes>> {
    let snapshot = match tracker.read() {
        Ok(guard) => guard.snapshot(),
        Err(_) => {
            return json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                r#"{"error":"state lock poisoned"}"#.into(),
            )
        }
    };
    let (head, totals) = snapshot;
    let body = TotalSupply::from_state(&head, &totals, None);
    match serde_json::to_string(&body) {
        Ok(json) => json_response(StatusCode::OK, json),
        Err(err) => {
            error!("Failed to encode state response: {}", err);
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                r#"{"error":"encoding failed"}"#.into(),
            )
        }
    }
}

fn json_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("response can be built from static parts")
}
