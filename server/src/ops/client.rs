use crate::db::{ArchiveClientCert, ClientCert, ClientCertContents, ServerCert};
use crate::ops::{
    AllowedIpEntry, ClientArchiveEntry, ClientResponse, InterfaceStatus, PeerStatus, PingStatus,
};
use crate::{wg, Context, ServerError};
use ipnet::IpNet;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::net::IpAddr;
use std::time::SystemTime;
use wireguard_control::{InterfaceName, KeyPair};

/// Any run of spaces and commas collapses to a single comma.
static ALLOWED_IPS_SEPARATORS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ ,]+").unwrap());

pub(crate) fn normalize_allowed_ips(raw: &str) -> String {
    ALLOWED_IPS_SEPARATORS
        .replace_all(raw.trim(), ",")
        .into_owned()
}

/// Issues a peer credential: validates or allocates the address, renders the
/// peer config, persists the record and pushes the peer to the device.
pub fn new_client(
    context: &Context,
    ifname: &str,
    ip: &str,
    allowed_ips: &str,
) -> Result<ClientResponse, ServerError> {
    let ifname = ifname.trim();
    let mut ip = ip.trim().to_string();
    let allowed_ips = normalize_allowed_ips(allowed_ips);

    let keypair = KeyPair::generate();
    let private = keypair.private.to_base64();
    let public = keypair.public.to_base64();

    check_ip_mask(context, ifname, &ip)?;

    let server = ServerCert::get_by_ifname(&context.db.lock(), ifname)?;

    if ip.is_empty() {
        let taken = ClientCert::ips_for_ifname(&context.db.lock(), ifname)?;
        ip = generate_ip(ifname, &server.ip, &taken)?;
    }

    let iface_subnet = context
        .netview
        .ipv4_of(ifname)?
        .ok_or_else(|| ServerError::invalid(format!("subnet {ifname} not found")))?;

    let config = render_peer_config(
        &private,
        &ip,
        &server.public,
        &config_allowed_csv(&iface_subnet, &allowed_ips),
        &server.endpoint,
        server.port,
    );

    ClientCert::create(
        &context.db.lock(),
        ClientCertContents {
            ifname: ifname.to_string(),
            private: private.clone(),
            public: public.clone(),
            ip: ip.clone(),
            allowed_ips: allowed_ips.clone(),
            config: config.clone(),
        },
    )?;

    apply_peer_config(context, ifname, &ip, &allowed_ips, &public)?;

    Ok(ClientResponse {
        ifname: ifname.to_string(),
        private,
        public,
        ip,
        allowed_ips,
        config,
        ping_status: PingStatus::default(),
    })
}

/// A requested address must sit in the same subnet as the live interface
/// address and must not collide with it. An empty request skips the check
/// (the allocator picks instead), but the interface itself must exist.
fn check_ip_mask(context: &Context, ifname: &str, requested: &str) -> Result<(), ServerError> {
    let names = context
        .netview
        .interface_names()
        .map_err(|e| ServerError::invalid(format!("error getting network interfaces: {e}")))?;
    if !names.iter().any(|name| name == ifname) {
        return Err(ServerError::invalid(format!("interface {ifname} not found")));
    }
    if requested.is_empty() {
        return Ok(());
    }
    match context.netview.ipv4_of(ifname)? {
        Some(iface_net) => check_ip_mask_against(requested, &iface_net),
        None => Ok(()),
    }
}

fn check_ip_mask_against(requested: &str, iface_net: &IpNet) -> Result<(), ServerError> {
    let client: IpNet = requested
        .parse()
        .map_err(|e| ServerError::invalid(format!("invalid CIDR format: {e}")))?;

    if client.trunc() != iface_net.trunc() {
        return Err(ServerError::invalid(format!(
            "incorrect subnet your ip {} and interface {}",
            client.trunc(),
            iface_net.trunc()
        )));
    }
    if client.addr() == iface_net.addr() {
        return Err(ServerError::invalid(format!(
            "ip {} cannot be same as interface {}",
            client.addr(),
            iface_net.network()
        )));
    }
    Ok(())
}

/// First free host address in the server's prefix, skipping the server's own
/// address and everything already handed out.
fn generate_ip(ifname: &str, server_cidr: &str, taken: &[String]) -> Result<String, ServerError> {
    let prefix: IpNet = server_cidr
        .parse()
        .map_err(|e| ServerError::invalid(format!("invalid CIDR format: {e}")))?;

    let taken: HashSet<&str> = taken.iter().map(String::as_str).collect();
    let server = format!("{}/{}", prefix.addr(), prefix.prefix_len());

    for host in prefix.hosts() {
        let candidate = format!("{}/{}", host, prefix.prefix_len());
        if candidate != server && !taken.contains(candidate.as_str()) {
            return Ok(candidate);
        }
    }

    Err(ServerError::invalid(format!(
        "cannot find free ip for interface {} subnet {}",
        ifname,
        prefix.trunc()
    )))
}

/// The allowed-IP set pushed to the kernel: the peer's own host route, every
/// user CIDR that does not already contain the peer, and the interface
/// subnet. Keyed by CIDR string so duplicates collapse.
fn effective_allowed_ips(
    client_ip: &IpNet,
    user_allowed: &str,
    iface_subnet: Option<&IpNet>,
) -> Vec<IpNet> {
    let mut seen = HashSet::new();
    let mut result = Vec::new();
    let mut push = |net: IpNet| {
        if seen.insert(net.to_string()) {
            result.push(net);
        }
    };

    let host_prefix = if client_ip.addr().is_ipv4() { 32 } else { 128 };
    if let Ok(host) = IpNet::new(client_ip.addr(), host_prefix) {
        push(host);
    }

    for part in user_allowed.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let Ok(net) = part.parse::<IpNet>() else {
            log::warn!("skipping unparseable allowed ip {part:?}");
            continue;
        };
        if !net.contains(&client_ip.addr()) {
            push(net.trunc());
        }
    }

    if let Some(subnet) = iface_subnet {
        push(subnet.trunc());
    }

    result
}

/// AllowedIPs line of the rendered peer config: the interface subnet plus
/// every parseable user CIDR, deduped.
fn config_allowed_csv(iface_subnet: &IpNet, user_allowed: &str) -> String {
    let mut seen = HashSet::new();
    let mut parts = Vec::new();

    for net in std::iter::once(iface_subnet.trunc()).chain(
        user_allowed
            .split(',')
            .filter_map(|part| part.trim().parse::<IpNet>().ok())
            .map(|net| net.trunc()),
    ) {
        let rendered = net.to_string();
        if seen.insert(rendered.clone()) {
            parts.push(rendered);
        }
    }

    parts.join(",")
}

fn render_peer_config(
    private: &str,
    ip: &str,
    server_public: &str,
    allowed_csv: &str,
    endpoint: &str,
    port: u16,
) -> String {
    format!(
        "[Interface]\nPrivateKey = {private}\nAddress = {ip}\n[Peer]\nPublicKey = {server_public}\n\
         AllowedIPs = {allowed_csv}\nEndpoint = {endpoint}:{port}\nPersistentKeepalive = 20\n"
    )
}

/// Pushes one peer to its device, replacing its allowed-IP set.
pub(crate) fn apply_peer_config(
    context: &Context,
    ifname: &str,
    client_ip: &str,
    allowed_ips: &str,
    public: &str,
) -> Result<(), ServerError> {
    let ip: IpNet = client_ip
        .parse()
        .map_err(|e| ServerError::invalid(format!("invalid CIDR format: {e}")))?;

    let iface_subnet = context.netview.ipv4_of(ifname).ok().flatten();
    let allowed = effective_allowed_ips(&ip, allowed_ips, iface_subnet.as_ref());

    if cfg!(not(test)) {
        let iface: InterfaceName = ifname.parse()?;
        wg::apply_peer(&iface, public, &allowed, context.backend)?;
    }
    Ok(())
}

/// Removes the peer everywhere: store (archived), kernel device, liveness map.
pub fn delete_client(context: &Context, public: &str) -> Result<(), ServerError> {
    let public = public.trim();

    let cert = {
        let mut conn = context.db.lock();
        ClientCert::delete(&mut conn, public)?
    };

    if cfg!(not(test)) {
        let iface: InterfaceName = cert.ifname.parse()?;
        wg::remove_peer(&iface, &cert.public, context.backend)?;
    }

    if let Some(ip) = cert
        .ip
        .split('/')
        .next()
        .and_then(|raw| raw.parse::<IpAddr>().ok())
    {
        context.liveness.delete(&ip);
    }

    Ok(())
}

/// Persisted peers joined with the liveness map. Peers whose stored address
/// carries no prefix read as unreachable.
pub fn all_clients(context: &Context) -> Result<Vec<ClientResponse>, ServerError> {
    let clients = ClientCert::list(&context.db.lock())?;
    Ok(clients
        .into_iter()
        .map(|cert| {
            let mut ping_status = PingStatus::default();
            let parts: Vec<&str> = cert.ip.split('/').collect();
            if parts.len() > 1 {
                if let Ok(ip) = parts[0].parse::<IpAddr>() {
                    let (status, rtt) = context.liveness.read(&ip);
                    ping_status = PingStatus {
                        status,
                        ping_time: rtt.as_micros() as i64,
                    };
                }
            }
            ClientResponse {
                ifname: cert.contents.ifname,
                private: cert.contents.private,
                public: cert.contents.public,
                ip: cert.contents.ip,
                allowed_ips: cert.contents.allowed_ips,
                config: cert.contents.config,
                ping_status,
            }
        })
        .collect())
}

pub fn client_archive(context: &Context) -> Result<Vec<ClientArchiveEntry>, ServerError> {
    let archived = ArchiveClientCert::list(&context.db.lock())?;
    Ok(archived
        .into_iter()
        .map(|entry| ClientArchiveEntry {
            ifname: entry.contents.ifname,
            private: entry.contents.private,
            public: entry.contents.public,
            ip: entry.contents.ip,
            allowed_ips: entry.contents.allowed_ips,
            config: entry.contents.config,
            deleted_at: entry.deleted_at,
        })
        .collect())
}

/// Live device telemetry for every WireGuard interface. Devices with no
/// peers still appear, with an empty status list.
pub fn status(context: &Context) -> Result<Vec<InterfaceStatus>, ServerError> {
    let devices = if cfg!(test) {
        Vec::new()
    } else {
        wg::devices(context.backend)?
    };

    Ok(devices
        .into_iter()
        .map(|device| InterfaceStatus {
            ifname: device.name.to_string(),
            status: device
                .peers
                .iter()
                .map(|peer| PeerStatus {
                    public: peer.config.public_key.to_base64(),
                    handshake: peer
                        .stats
                        .last_handshake_time
                        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
                        .map(|d| d.as_secs())
                        .unwrap_or(0),
                    received: peer.stats.rx_bytes,
                    transmitted: peer.stats.tx_bytes,
                    allowed_ips: peer
                        .config
                        .allowed_ips
                        .iter()
                        .map(|ip| AllowedIpEntry {
                            ip: ip.address.to_string(),
                            mask: ip.cidr,
                        })
                        .collect(),
                    endpoint: peer
                        .config
                        .endpoint
                        .map(|endpoint| endpoint.to_string())
                        .unwrap_or_default(),
                })
                .collect(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_allowed_ips() {
        assert_eq!(
            normalize_allowed_ips("10.0.0.0/8 , 192.168.0.0/16,,  172.16.0.0/12"),
            "10.0.0.0/8,192.168.0.0/16,172.16.0.0/12"
        );
        assert_eq!(normalize_allowed_ips(""), "");
        assert_eq!(normalize_allowed_ips("  10.0.0.0/8  "), "10.0.0.0/8");
    }

    #[test]
    fn test_check_ip_mask_rejects_foreign_subnet() {
        let iface: IpNet = "10.0.0.1/24".parse().unwrap();
        let err = check_ip_mask_against("10.0.1.5/24", &iface).unwrap_err();
        assert!(err.to_string().contains("incorrect subnet"));

        // Same address range, different prefix length is a different subnet.
        let err = check_ip_mask_against("10.0.0.5/25", &iface).unwrap_err();
        assert!(err.to_string().contains("incorrect subnet"));
    }

    #[test]
    fn test_check_ip_mask_rejects_interface_address() {
        let iface: IpNet = "10.0.0.1/24".parse().unwrap();
        let err = check_ip_mask_against("10.0.0.1/24", &iface).unwrap_err();
        assert!(err.to_string().contains("cannot be same as interface"));
    }

    #[test]
    fn test_check_ip_mask_accepts_free_address() {
        let iface: IpNet = "10.0.0.1/24".parse().unwrap();
        check_ip_mask_against("10.0.0.7/24", &iface).unwrap();
    }

    #[test]
    fn test_generate_ip_skips_server_and_taken() {
        let taken = vec!["10.0.0.2/24".to_string(), "10.0.0.3/24".to_string()];
        assert_eq!(
            generate_ip("wg0", "10.0.0.1/24", &taken).unwrap(),
            "10.0.0.4/24"
        );
    }

    #[test]
    fn test_generate_ip_exhaustion() {
        // A /30 has two usable hosts; the server occupies .1, a client .2.
        let taken = vec!["10.0.0.2/30".to_string()];
        let err = generate_ip("wg0", "10.0.0.1/30", &taken).unwrap_err();
        assert!(err.to_string().contains("cannot find free ip"));
    }

    #[test]
    fn test_generate_ip_succeeds_exactly_free_count_times() {
        // /29: hosts .1..*.6, server at .1, so 5 free addresses.
        let mut taken: Vec<String> = Vec::new();
        for expected in ["10.0.0.2/29", "10.0.0.3/29", "10.0.0.4/29", "10.0.0.5/29", "10.0.0.6/29"]
        {
            let got = generate_ip("wg0", "10.0.0.1/29", &taken).unwrap();
            assert_eq!(got, expected);
            taken.push(got);
        }
        assert!(generate_ip("wg0", "10.0.0.1/29", &taken).is_err());
    }

    #[test]
    fn test_effective_allowed_ips_includes_host_and_subnet() {
        let client: IpNet = "10.0.0.2/24".parse().unwrap();
        let subnet: IpNet = "10.0.0.0/24".parse().unwrap();
        let allowed = effective_allowed_ips(&client, "192.168.0.0/16", Some(&subnet));

        let rendered: Vec<String> = allowed.iter().map(|net| net.to_string()).collect();
        assert_eq!(rendered, vec!["10.0.0.2/32", "192.168.0.0/16", "10.0.0.0/24"]);
    }

    #[test]
    fn test_effective_allowed_ips_drops_cidrs_containing_peer() {
        let client: IpNet = "10.0.0.2/24".parse().unwrap();
        // 10.0.0.0/16 contains the peer address and must not be routed wholesale.
        let allowed = effective_allowed_ips(&client, "10.0.0.0/16,8.8.8.8/32", None);

        let rendered: Vec<String> = allowed.iter().map(|net| net.to_string()).collect();
        assert_eq!(rendered, vec!["10.0.0.2/32", "8.8.8.8/32"]);
    }

    #[test]
    fn test_effective_allowed_ips_collapses_duplicates() {
        let client: IpNet = "10.0.0.2/24".parse().unwrap();
        let subnet: IpNet = "10.0.0.0/24".parse().unwrap();
        let allowed =
            effective_allowed_ips(&client, "192.168.0.0/16,192.168.5.0/16", Some(&subnet));

        // Both user entries truncate to 192.168.0.0/16.
        let rendered: Vec<String> = allowed.iter().map(|net| net.to_string()).collect();
        assert_eq!(rendered, vec!["10.0.0.2/32", "192.168.0.0/16", "10.0.0.0/24"]);
    }

    #[test]
    fn test_config_allowed_csv() {
        let subnet: IpNet = "10.0.0.0/24".parse().unwrap();
        assert_eq!(
            config_allowed_csv(&subnet, "192.168.0.0/16,bogus,10.0.0.0/24"),
            "10.0.0.0/24,192.168.0.0/16"
        );
        assert_eq!(config_allowed_csv(&subnet, ""), "10.0.0.0/24");
    }

    #[test]
    fn test_render_peer_config() {
        let config = render_peer_config("PRIV", "10.0.0.2/24", "SRVPUB", "10.0.0.0/24", "203.0.113.5", 51820);
        assert_eq!(
            config,
            "[Interface]\nPrivateKey = PRIV\nAddress = 10.0.0.2/24\n[Peer]\nPublicKey = SRVPUB\n\
             AllowedIPs = 10.0.0.0/24\nEndpoint = 203.0.113.5:51820\nPersistentKeepalive = 20\n"
        );
    }
}
