use hyper::{
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Readiness inputs flipped by the rest of the process. Liveness is
/// simply the process answering.
#[derive(Default)]
pub struct ReadinessState {
    controllers_started: AtomicBool,
    cloud_reachable: AtomicBool,
    leader_state_known: AtomicBool,
}

impl ReadinessState {
    pub fn set_controllers_started(&self, value: bool) {
        self.controllers_started.store(value, Ordering::Relaxed);
    }

    pub fn set_cloud_reachable(&self, value: bool) {
        self.cloud_reachable.store(value, Ordering::Relaxed);
    }

    pub fn set_leader_state_known(&self, value: bool) {
        self.leader_state_known.store(value, Ordering::Relaxed);
    }

    pub fn ready(&self) -> bool {
        self.controllers_started.load(Ordering::Relaxed)
            && self.cloud_reachable.load(Ordering::Relaxed)
            && self.leader_state_known.load(Ordering::Relaxed)
    }

    fn describe(&self) -> String {
        format!(
            "controllers_started={} cloud_reachable={} leader_state_known={}",
            self.controllers_started.load(Ordering::Relaxed),
            self.cloud_reachable.load(Ordering::Relaxed),
            self.leader_state_known.load(Ordering::Relaxed),
        )
    }
}

async fn serve_req(
    req: Request<Body>,
    state: Arc<ReadinessState>,
) -> Result<Response<Body>, hyper::Error> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/healthz") => Response::new(Body::from("ok")),
        (&Method::GET, "/readyz") => {
            if state.ready() {
                Response::new(Body::from("ok"))
            } else {
                Response::builder()
                    .status(StatusCode::SERVICE_UNAVAILABLE)
                    .body(Body::from(state.describe()))
                    .unwrap()
            }
        }
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::empty())
            .unwrap(),
    };
    Ok(response)
}

/// Runs the liveness/readiness server on the given address.
pub async fn run_server(addr: SocketAddr, state: Arc<ReadinessState>) {
    info!(%addr, "health server listening");
    let serve_future = Server::bind(&addr).serve(make_service_fn(move |_| {
        let state = state.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| serve_req(req, state.clone())))
        }
    }));
    if let Err(err) = serve_future.await {
        panic!("health server error: {}", err);
    }
    panic!("health server exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_requires_all_inputs() {
        let state = ReadinessState::default();
        assert!(!state.ready());
        state.set_controllers_started(true);
        state.set_cloud_reachable(true);
        assert!(!state.ready());
        state.set_leader_state_known(true);
        assert!(state.ready());
        state.set_cloud_reachable(false);
        assert!(!state.ready());
    }
}
