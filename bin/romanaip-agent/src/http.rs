//! Agent HTTP surface consumed by the listener's push bridge

use crate::store::EtcdStore;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::tokio::TokioIo;
use romanaip_api::{ExposedIpSpec, RomanaIp};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Serves `POST /romanaip` and `DELETE /romanaip/<address>`. Handlers write
/// through the store, so the binding converges on every node via the watch
/// path rather than being applied directly here.
pub async fn serve(store: EtcdStore, node_address: Ipv4Addr, port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let listener = TcpListener::bind(&addr).await?;
    info!("Agent HTTP surface listening on {}", addr);

    loop {
        let (stream, peer) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let store = store.clone();
        tokio::task::spawn(async move {
            let service =
                service_fn(move |request| handle(request, store.clone(), node_address));
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Connection error from {}: {}", peer, err);
            }
        });
    }
}

async fn handle(
    request: Request<Incoming>,
    store: EtcdStore,
    node_address: Ipv4Addr,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    match (method, path.as_str()) {
        (Method::POST, "/romanaip") => {
            let body = request.into_body().collect().await?.to_bytes();
            let ip = String::from_utf8_lossy(&body).trim().to_string();
            if ip.parse::<IpAddr>().is_err() {
                return Ok(text(StatusCode::BAD_REQUEST, "invalid romanaIP address\n"));
            }

            let spec = ExposedIpSpec {
                romana_ip: RomanaIp {
                    auto: false,
                    ip: ip.clone(),
                },
                node_ip_address: node_address.to_string(),
            };
            match store.put_exposed_ip(&spec).await {
                Ok(()) => Ok(text(StatusCode::OK, &ip)),
                Err(err) => {
                    warn!("store write for romanaIP {} failed: {}", ip, err);
                    Ok(text(StatusCode::BAD_GATEWAY, "store write failed\n"))
                }
            }
        }
        (Method::DELETE, path) => match unbind_target(path) {
            Some(ip) => match store.delete_exposed_ip(ip).await {
                Ok(()) => Ok(text(StatusCode::OK, ip)),
                Err(err) => {
                    warn!("store delete for romanaIP {} failed: {}", ip, err);
                    Ok(text(StatusCode::BAD_GATEWAY, "store delete failed\n"))
                }
            },
            None => Ok(text(StatusCode::NOT_FOUND, "not found\n")),
        },
        _ => Ok(text(StatusCode::NOT_FOUND, "not found\n")),
    }
}

/// The address segment of `/romanaip/<address>`, if it parses as an IP.
fn unbind_target(path: &str) -> Option<&str> {
    let ip = path.strip_prefix("/romanaip/")?;
    if ip.is_empty() || ip.contains('/') {
        return None;
    }
    ip.parse::<IpAddr>().ok()?;
    Some(ip)
}

fn text(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}
