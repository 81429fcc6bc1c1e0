use anyhow::anyhow;
use clap::Parser;
use parking_lot::Mutex;
use std::{env, net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::sync::watch;
use wgpanel_server::{
    config::ServerConfig,
    firewall::Firewall,
    netif::SystemNetView,
    ops,
    probe::{self, LivenessMap, RawSocketFactory},
    runner::{CommandRunner, SystemRunner},
    serve, tls, Context, Db, Error, VERSION,
};
use wireguard_control::Backend;

#[derive(Debug, Parser)]
#[clap(name = "wgpanel-server", author, version, about)]
struct Opts {
    /// Path of the INI configuration file.
    #[clap(short, long, default_value = "/etc/wgpanel.cfg")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    if env::var_os("RUST_LOG").is_none() {
        // Set some default log settings.
        env::set_var("RUST_LOG", "info");
    }
    pretty_env_logger::init();

    let opts = Opts::parse();

    if unsafe { libc::getuid() } != 0 {
        return Err(anyhow!("wgpanel-server must run as root."));
    }

    let cfg = ServerConfig::from_file(&opts.config)?;
    log::info!("wgpanel-server {VERSION} starting on {}", cfg.ip_port);

    let conn = wgpanel_server::open_database(&cfg.database)?;
    let db: Db = Arc::new(Mutex::new(conn));

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
    let context = Context {
        db: db.clone(),
        firewall: Arc::new(Firewall::new(runner.clone())),
        liveness: Arc::new(LivenessMap::new()),
        runner,
        netview: Arc::new(SystemNetView),
        backend: Backend::default(),
        token: cfg.token.clone(),
        whitelist: cfg.whitelist_ip_access.clone(),
        delete_interface: cfg.delete_interface,
        delete_client: cfg.delete_client,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(probe::ping_loop(
        db.clone(),
        context.liveness.clone(),
        Arc::new(RawSocketFactory),
        shutdown_rx.clone(),
    ));

    ops::rules::first_start_iptables(&context);
    ops::interface::start_interfaces(&context);

    let tls_config = tls::server_config(&cfg)?;
    let addr: SocketAddr = cfg
        .ip_port
        .parse()
        .map_err(|e| anyhow!("bad ip_port {:?}: {}", cfg.ip_port, e))?;

    let server = tokio::spawn(serve(context.clone(), addr, tls_config, shutdown_rx));

    wait_for_signal().await;

    // Interfaces come down synchronously before the store closes.
    ops::interface::stop_interfaces(&context);
    let _ = shutdown_tx.send(true);
    if let Err(e) = server.await? {
        log::error!("server: {e}");
    }

    Ok(())
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            log::error!("cannot install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => log::info!("received SIGINT"),
        _ = term.recv() => log::info!("received SIGTERM"),
    }
}
