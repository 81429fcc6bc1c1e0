use hyper::{header, http, server::conn::Http, service::service_fn, Body, Method, Request, Response};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::{
    collections::VecDeque,
    convert::TryInto,
    net::{IpAddr, SocketAddr},
    path::Path,
    sync::Arc,
    time::Duration,
};
use subtle::ConstantTimeEq;
use tokio::{net::TcpListener, sync::watch};
use tokio_rustls::{rustls, TlsAcceptor};
use wireguard_control::Backend;

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod firewall;
pub mod netif;
pub mod ops;
pub mod probe;
pub mod runner;
pub mod tls;
pub mod util;
pub mod wg;

pub use error::ServerError;

pub type Error = anyhow::Error;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub type Db = Arc<Mutex<Connection>>;

/// Everything a request handler needs: the store, the kernel adapters, the
/// liveness map and the gate/auth material from the config file.
#[derive(Clone)]
pub struct Context {
    pub db: Db,
    pub firewall: Arc<firewall::Firewall>,
    pub liveness: Arc<probe::LivenessMap>,
    pub runner: Arc<dyn runner::CommandRunner>,
    pub netview: Arc<dyn netif::NetView>,
    pub backend: Backend,
    pub token: String,
    pub whitelist: Vec<IpAddr>,
    pub delete_interface: bool,
    pub delete_client: bool,
}

pub fn open_database<P: AsRef<Path>>(path: P) -> Result<Connection, Error> {
    let conn = Connection::open(path)?;
    // Foreign key constraints aren't on in SQLite by default. Enable.
    conn.pragma_update(None, "foreign_keys", 1)?;
    db::auto_migrate(&conn)?;
    Ok(conn)
}

pub async fn hyper_service(
    req: Request<Body>,
    context: Context,
    remote_addr: SocketAddr,
) -> Result<Response<Body>, http::Error> {
    // Break the path into components.
    let components: VecDeque<_> = req
        .uri()
        .path()
        .trim_start_matches('/')
        .split('/')
        .map(String::from)
        .collect();

    routes(req, context, remote_addr, components)
        .await
        .or_else(TryInto::try_into)
}

async fn routes(
    req: Request<Body>,
    context: Context,
    remote_addr: SocketAddr,
    mut components: VecDeque<String>,
) -> Result<Response<Body>, ServerError> {
    if !context.whitelist.contains(&remote_addr.ip()) {
        return Err(ServerError::Forbidden);
    }
    check_token(&req, &context)?;

    match components.pop_front().as_deref() {
        Some("version") if req.method() == Method::GET => util::result_response(VERSION),
        Some("interface") => api::interface::routes(req, components, context).await,
        Some("server") => api::rules::routes(req, components, context).await,
        Some("clients") => api::client::routes(req, components, context).await,
        _ => Err(ServerError::NotFound),
    }
}

fn check_token(req: &Request<Body>, context: &Context) -> Result<(), ServerError> {
    let header = req
        .headers()
        .get(header::AUTHORIZATION)
        .ok_or(ServerError::Unauthorized)?;
    let header = header.to_str().map_err(|_| ServerError::Unauthorized)?;
    let token = header
        .strip_prefix("Bearer ")
        .ok_or(ServerError::Unauthorized)?;

    if !bool::from(token.as_bytes().ct_eq(context.token.as_bytes())) {
        return Err(ServerError::Unauthorized);
    }
    Ok(())
}

/// TLS accept loop. Each connection gets its own task; a shutdown signal
/// stops accepting and leaves a one-second drain window for requests that
/// are already in flight.
pub async fn serve(
    context: Context,
    addr: SocketAddr,
    tls: Arc<rustls::ServerConfig>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Error> {
    let listener = TcpListener::bind(addr).await?;
    let acceptor = TlsAcceptor::from(tls);
    log::info!("listening on https://{addr}");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, remote_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::warn!("accept: {e}");
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let context = context.clone();
                tokio::spawn(async move {
                    let stream = match acceptor.accept(stream).await {
                        Ok(stream) => stream,
                        Err(e) => {
                            log::debug!("{remote_addr} - TLS handshake failed: {e}");
                            return;
                        }
                    };
                    let service = service_fn(move |req: Request<Body>| {
                        log::debug!("{} - {} {}", &remote_addr, req.method(), req.uri());
                        hyper_service(req, context.clone(), remote_addr)
                    });
                    if let Err(e) = Http::new().serve_connection(stream, service).await {
                        log::debug!("{remote_addr} - connection error: {e}");
                    }
                });
            }
        }
    }

    tokio::time::sleep(Duration::from_secs(1)).await;
    Ok(())
}
