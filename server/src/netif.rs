use ipnet::{IpNet, Ipv4Net};
use std::io;

/// Read-only view of the host's network interfaces. The live implementation
/// asks the kernel; tests substitute a fixed map.
pub trait NetView: Send + Sync {
    /// Names of every interface on the host, loopback included.
    fn interface_names(&self) -> io::Result<Vec<String>>;

    /// The first IPv4 address (with prefix) assigned to `ifname`, or `None`
    /// when the interface exists without one.
    fn ipv4_of(&self, ifname: &str) -> io::Result<Option<IpNet>>;
}

pub struct SystemNetView;

impl NetView for SystemNetView {
    fn interface_names(&self) -> io::Result<Vec<String>> {
        let mut names: Vec<String> = Vec::new();
        for ifaddr in nix::ifaddrs::getifaddrs()? {
            if !names.contains(&ifaddr.interface_name) {
                names.push(ifaddr.interface_name);
            }
        }
        Ok(names)
    }

    fn ipv4_of(&self, ifname: &str) -> io::Result<Option<IpNet>> {
        let mut found = false;
        for ifaddr in nix::ifaddrs::getifaddrs()? {
            if ifaddr.interface_name != ifname {
                continue;
            }
            found = true;
            let (Some(address), Some(netmask)) = (ifaddr.address, ifaddr.netmask) else {
                continue;
            };
            let (Some(address), Some(netmask)) =
                (address.as_sockaddr_in(), netmask.as_sockaddr_in())
            else {
                continue;
            };
            let prefix = u32::from(netmask.ip()).count_ones() as u8;
            let net = Ipv4Net::new(address.ip(), prefix)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            return Ok(Some(IpNet::V4(net)));
        }
        if found {
            Ok(None)
        } else {
            Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("interface {ifname} not found"),
            ))
        }
    }
}

/// Interface names with the loopback filtered out, as reported alongside the
/// persisted rule tables.
pub fn non_loopback_names(view: &dyn NetView) -> Vec<String> {
    match view.interface_names() {
        Ok(names) => names.into_iter().filter(|name| name != "lo").collect(),
        Err(e) => {
            log::error!("cannot list interfaces: {e}");
            Vec::new()
        }
    }
}
