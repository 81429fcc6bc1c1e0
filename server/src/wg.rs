use crate::runner::CommandRunner;
use crate::ServerError;
use ipnet::IpNet;
use wireguard_control::{Backend, Device, DeviceUpdate, InterfaceName, Key};

fn ip_cmd(runner: &dyn CommandRunner, args: &[&str]) -> Result<(), ServerError> {
    let out = runner.run("ip", args)?;
    if !out.success {
        return Err(ServerError::invalid(format!(
            "ip {}: {}",
            args.join(" "),
            out.text().trim()
        )));
    }
    Ok(())
}

/// `ip link add dev <ifname> type wireguard`. Fails when the device exists.
pub fn link_add(runner: &dyn CommandRunner, ifname: &str) -> Result<(), ServerError> {
    ip_cmd(runner, &["link", "add", "dev", ifname, "type", "wireguard"])
}

/// `ip addr add <cidr> dev <ifname>`.
pub fn link_addr_add(runner: &dyn CommandRunner, ifname: &str, cidr: &str) -> Result<(), ServerError> {
    ip_cmd(runner, &["addr", "add", cidr, "dev", ifname])
}

/// `ip link set <ifname> up`.
pub fn link_up(runner: &dyn CommandRunner, ifname: &str) -> Result<(), ServerError> {
    ip_cmd(runner, &["link", "set", ifname, "up"])
}

/// `ip link del dev <ifname> type wireguard`.
pub fn link_del(runner: &dyn CommandRunner, ifname: &str) -> Result<(), ServerError> {
    ip_cmd(runner, &["link", "del", "dev", ifname, "type", "wireguard"])
}

/// Whether a WireGuard device with this name is currently present. Start is
/// a no-op when it is, stop is a no-op when it is not.
pub fn device_exists(backend: Backend, ifname: &InterfaceName) -> Result<bool, ServerError> {
    Ok(Device::list(backend)?.iter().any(|name| name == ifname))
}

/// Full device + peer telemetry for every WireGuard interface on the host.
pub fn devices(backend: Backend) -> Result<Vec<Device>, ServerError> {
    Device::list(backend)?
        .iter()
        .map(|name| Device::get(name, backend).map_err(ServerError::from))
        .collect()
}

/// Pushes the device-level configuration: private key, listen port, and an
/// atomic replacement of the peer list.
pub fn configure_device(
    ifname: &InterfaceName,
    private: &str,
    listen_port: u16,
    backend: Backend,
) -> Result<(), ServerError> {
    DeviceUpdate::new()
        .set_private_key(Key::from_base64(private)?)
        .set_listen_port(listen_port)
        .replace_peers()
        .apply(ifname, backend)?;
    Ok(())
}

/// Adds (or updates) one peer, replacing its allowed-IP set.
pub fn apply_peer(
    ifname: &InterfaceName,
    public: &str,
    allowed_ips: &[IpNet],
    backend: Backend,
) -> Result<(), ServerError> {
    let mut peer = wireguard_control::PeerConfigBuilder::new(&Key::from_base64(public)?)
        .replace_allowed_ips();
    for net in allowed_ips {
        peer = peer.add_allowed_ip(net.addr(), net.prefix_len());
    }
    DeviceUpdate::new().add_peer(peer).apply(ifname, backend)?;
    Ok(())
}

/// Removes one peer from the device.
pub fn remove_peer(
    ifname: &InterfaceName,
    public: &str,
    backend: Backend,
) -> Result<(), ServerError> {
    DeviceUpdate::new()
        .remove_peer_by_key(&Key::from_base64(public)?)
        .apply(ifname, backend)?;
    Ok(())
}
