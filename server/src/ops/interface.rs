use crate::db::{ClientCert, ServerCert, ServerCertContents};
use crate::ops::{ServerArchiveEntry, ServerInterface};
use crate::{wg, Context, ServerError};
use ipnet::IpNet;
use wireguard_control::{InterfaceName, KeyPair};

/// Provisions a tunnel: generates the keypair, persists the record, then
/// brings the kernel device up. The rendered config is returned to the
/// operator once and never changes afterwards.
pub fn new_interface(
    context: &Context,
    ifname: &str,
    ip: &str,
    endpoint: &str,
    port: u16,
) -> Result<ServerInterface, ServerError> {
    let ifname = ifname.trim().to_lowercase();
    let ip = ip.trim();
    let endpoint = endpoint.trim();

    let live = context.netview.interface_names()?;
    if live.iter().any(|name| *name == ifname) {
        return Err(ServerError::invalid(format!(
            "interface {ifname} already exist"
        )));
    }
    // Also validates against kernel naming rules before anything persists.
    let _: InterfaceName = ifname.parse()?;

    let keypair = KeyPair::generate();
    let private = keypair.private.to_base64();
    let public = keypair.public.to_base64();

    if let Err(e) = ip.parse::<IpNet>() {
        return Err(ServerError::invalid(format!("invalid CIDR format: {e}")));
    }

    let config = render_server_config(&private, ip, port);
    ServerCert::create(
        &context.db.lock(),
        ServerCertContents {
            ifname: ifname.clone(),
            private: private.clone(),
            public: public.clone(),
            endpoint: endpoint.to_string(),
            ip: ip.to_string(),
            port,
            config: config.clone(),
        },
    )?;

    start_link(context, &ifname)?;

    Ok(ServerInterface {
        ifname,
        ip: ip.to_string(),
        port,
        private,
        public,
        endpoint: endpoint.to_string(),
        config,
    })
}

fn render_server_config(private: &str, ip: &str, listen_port: u16) -> String {
    format!("[Interface]\nPrivateKey = {private}\nAddress = {ip}\nListenPort = {listen_port}\n")
}

/// The full start sequence: link add, address, up, device config, then every
/// persisted peer. Peer push failures are logged so one bad row cannot keep
/// the device down.
fn start_link(context: &Context, ifname: &str) -> Result<(), ServerError> {
    let server = ServerCert::get_by_ifname(&context.db.lock(), ifname)?;

    wg::link_add(context.runner.as_ref(), ifname)?;
    wg::link_addr_add(context.runner.as_ref(), ifname, &server.ip)?;
    wg::link_up(context.runner.as_ref(), ifname)?;

    if cfg!(not(test)) {
        let iface: InterfaceName = ifname.parse()?;
        wg::configure_device(&iface, &server.private, server.port, context.backend)?;
    }

    let clients = match ClientCert::list_by_ifname(&context.db.lock(), ifname) {
        Ok(clients) => clients,
        Err(e) => {
            log::error!("start interface {ifname}: {e}");
            return Ok(());
        }
    };
    for peer in clients {
        if let Err(e) =
            super::client::apply_peer_config(context, &peer.ifname, &peer.ip, &peer.allowed_ips, &peer.public)
        {
            log::error!("start interface {ifname}: peer {}: {e}", peer.public);
        }
    }
    Ok(())
}

fn stop_link(context: &Context, ifname: &str) -> Result<(), ServerError> {
    wg::link_del(context.runner.as_ref(), ifname)
}

/// No-op when the device is already up.
pub fn start_interface(context: &Context, ifname: &str) -> Result<(), ServerError> {
    let ifname = ifname.trim();
    if cfg!(not(test)) {
        let iface: InterfaceName = ifname.parse()?;
        if wg::device_exists(context.backend, &iface)? {
            return Ok(());
        }
    }
    start_link(context, ifname)
}

/// No-op when the device is already down.
pub fn stop_interface(context: &Context, ifname: &str) -> Result<(), ServerError> {
    let ifname = ifname.trim();
    if cfg!(not(test)) {
        let iface: InterfaceName = ifname.parse()?;
        if !wg::device_exists(context.backend, &iface)? {
            return Ok(());
        }
    }
    stop_link(context, ifname)
}

/// Archives the server record and its peers (validating the private key),
/// then tears the kernel link down.
pub fn delete_server(context: &Context, private: &str, ifname: &str) -> Result<(), ServerError> {
    let ifname = ifname.trim();
    {
        let mut conn = context.db.lock();
        ServerCert::delete(&mut conn, private.trim(), ifname)?;
    }
    stop_link(context, ifname)
}

pub fn server_interfaces(context: &Context) -> Result<Vec<ServerInterface>, ServerError> {
    let servers = ServerCert::list(&context.db.lock())?;
    Ok(servers
        .into_iter()
        .map(|cert| ServerInterface {
            ifname: cert.contents.ifname,
            ip: cert.contents.ip,
            port: cert.contents.port,
            private: cert.contents.private,
            public: cert.contents.public,
            endpoint: cert.contents.endpoint,
            config: String::new(),
        })
        .collect())
}

pub fn server_archive(context: &Context) -> Result<Vec<ServerArchiveEntry>, ServerError> {
    let archived = crate::db::ArchiveServerCert::list(&context.db.lock())?;
    Ok(archived
        .into_iter()
        .map(|entry| ServerArchiveEntry {
            ifname: entry.contents.ifname,
            ip: entry.contents.ip,
            port: entry.contents.port,
            private: entry.contents.private,
            public: entry.contents.public,
            endpoint: entry.contents.endpoint,
            deleted_at: entry.deleted_at,
        })
        .collect())
}

/// Boot sweep: bring every persisted tunnel up, then push every persisted
/// peer. Failures are logged and skipped so one bad row cannot prevent boot.
pub fn start_interfaces(context: &Context) {
    let servers = match ServerCert::list(&context.db.lock()) {
        Ok(servers) => servers,
        Err(e) => {
            log::error!("start interfaces: {e}");
            return;
        }
    };
    for server in servers {
        if let Err(e) = start_interface(context, &server.ifname) {
            log::error!("start interfaces: {}: {e}", server.ifname);
        }
    }

    let clients = match ClientCert::list(&context.db.lock()) {
        Ok(clients) => clients,
        Err(e) => {
            log::error!("start interfaces: {e}");
            return;
        }
    };
    for client in clients {
        if let Err(e) = super::client::apply_peer_config(
            context,
            &client.ifname,
            &client.ip,
            &client.allowed_ips,
            &client.public,
        ) {
            log::error!("start interfaces: peer {}: {e}", client.public);
        }
    }
}

/// Shutdown sweep: tear down every persisted tunnel, logging failures.
pub fn stop_interfaces(context: &Context) {
    let servers = match ServerCert::list(&context.db.lock()) {
        Ok(servers) => servers,
        Err(e) => {
            log::error!("stop interfaces: {e}");
            return;
        }
    };
    for server in servers {
        if let Err(e) = stop_link(context, &server.ifname) {
            log::error!("stop interfaces: {}: {e}", server.ifname);
        }
    }
}
