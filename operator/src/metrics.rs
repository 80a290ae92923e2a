use hyper::{
    header::CONTENT_TYPE,
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server,
};
use prometheus::{Encoder, Registry, TextEncoder};
use std::net::SocketAddr;
use tracing::info;

/// Handler to serve the prometheus metrics to the request.
async fn serve_req(
    _req: Request<Body>,
    registry: Registry,
) -> Result<Response<Body>, hyper::Error> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer).unwrap();
    let response = Response::builder()
        .status(200)
        .header(CONTENT_TYPE, encoder.format_type())
        .body(Body::from(buffer))
        .unwrap();
    Ok(response)
}

/// Runs the prometheus exposition server on the given address. The
/// registry is the injected one all components registered against;
/// there is no process-global registry in this binary.
pub async fn run_server(addr: SocketAddr, registry: Registry) {
    info!(%addr, "metrics server listening");
    let serve_future = Server::bind(&addr).serve(make_service_fn(move |_| {
        let registry = registry.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| serve_req(req, registry.clone())))
        }
    }));
    if let Err(err) = serve_future.await {
        panic!("metrics server error: {}", err);
    }
    panic!("metrics server exited");
}
