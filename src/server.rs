use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

use axum::middleware::{from_fn, from_fn_with_state};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::middleware;
use crate::proxy::{self, GatewayState};

/// Hard, non-configurable ceiling on the shutdown drain.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

/// Accept-queue backlog per listener.
const LISTEN_BACKLOG: i32 = 1024;

pub struct Server {
    config: Config,
    engine: Arc<Engine>,
}

impl Server {
    pub fn new(config: Config, engine: Arc<Engine>) -> Self {
        Self { config, engine }
    }

    /// The gateway application: a single catch-all proxy route behind the
    /// access gate and request logging.
    pub fn router(state: GatewayState) -> Router {
        Router::new()
            .fallback(proxy::forward)
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(from_fn(middleware::logging_middleware))
                    .layer(from_fn_with_state(state.clone(), middleware::jwt_auth)),
            )
            .with_state(state)
    }

    /// Serve until a termination signal, then drain within the grace period.
    ///
    /// One acceptor task per available processor, each bound to the same
    /// reusable address so the kernel spreads accept-queue load.
    pub async fn run(self) -> Result<()> {
        raise_fd_limit();

        let addr = self.config.listen_addr()?;
        let state = GatewayState::new(self.engine.clone(), self.config.jwt_secret.clone());
        let make_svc = Self::router(state).into_make_service_with_connect_info::<SocketAddr>();

        let tls = if self.config.proto == "https" {
            let config = RustlsConfig::from_pem_file(&self.config.pem_path, &self.config.key_path)
                .await
                .map_err(|err| Error::Config(format!("tls setup failed: {err}")))?;
            Some(config)
        } else {
            None
        };

        let handle = Handle::new();
        let acceptors = num_cpus::get().max(1);
        let mut tasks = Vec::with_capacity(acceptors);
        for _ in 0..acceptors {
            let listener = reuse_port_listener(addr)?;
            let handle = handle.clone();
            let make_svc = make_svc.clone();
            let task = match tls.clone() {
                Some(tls) => tokio::spawn(
                    axum_server::from_tcp_rustls(listener, tls)
                        .handle(handle)
                        .serve(make_svc),
                ),
                None => tokio::spawn(
                    axum_server::from_tcp(listener).handle(handle).serve(make_svc),
                ),
            };
            tasks.push(task);
        }
        info!(
            host = %self.config.host,
            proto = %self.config.proto,
            acceptors,
            "bulu gateway listening"
        );

        shutdown_signal().await;
        info!("draining connections");
        handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
        for task in tasks {
            if let Ok(Err(err)) = task.await {
                warn!(error = %err, "acceptor exited with error");
            }
        }
        info!("safe exit");
        Ok(())
    }
}

/// A listener with SO_REUSEADDR and SO_REUSEPORT set, so several acceptor
/// tasks can bind the same address.
fn reuse_port_listener(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

/// Raise the NOFILE soft limit to the hard ceiling once at startup; many
/// reusable sockets plus concurrent backend connections exhaust the default.
fn raise_fd_limit() {
    match rlimit::increase_nofile_limit(u64::MAX) {
        Ok(limit) => info!(limit, "open file limit raised"),
        Err(err) => warn!(error = %err, "could not raise open file limit"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            info!("received terminate signal, initiating graceful shutdown");
        },
    }
}
