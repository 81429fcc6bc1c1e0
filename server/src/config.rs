use anyhow::{anyhow, Context as _};
use ini::Ini;
use std::{
    net::IpAddr,
    path::{Path, PathBuf},
};

/// Daemon configuration, loaded once at boot from an INI file's `[Server]`
/// section. A load failure is fatal.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Bind address of the HTTPS listener, e.g. `0.0.0.0:8443`.
    pub ip_port: String,
    pub tls_private: PathBuf,
    pub tls_public: PathBuf,
    /// Path of the SQLite database file.
    pub database: PathBuf,
    /// Bearer token every request must present.
    pub token: String,
    pub delete_interface: bool,
    pub delete_client: bool,
    /// Client IPs allowed to talk to the API at all.
    pub whitelist_ip_access: Vec<IpAddr>,
}

impl ServerConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        let ini = Ini::load_from_file(path)
            .map_err(|e| anyhow!("cannot read config {}: {}", path.display(), e))?;
        let section = ini
            .section(Some("Server"))
            .with_context(|| format!("no [Server] section in {}", path.display()))?;

        let get = |key: &str| section.get(key).unwrap_or_default().trim().to_string();

        let token = get("token");
        if token.is_empty() {
            return Err(anyhow!("empty token, please check config"));
        }

        let whitelist_ip_access = get("whitelist_ip_access")
            .split(',')
            .filter_map(|ip| {
                let ip = ip.trim();
                if ip.is_empty() {
                    return None;
                }
                Some(
                    ip.parse::<IpAddr>()
                        .map_err(|e| anyhow!("bad whitelist_ip_access entry {:?}: {}", ip, e)),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            ip_port: get("ip_port"),
            tls_private: get("tls_private").into(),
            tls_public: get("tls_public").into(),
            database: get("database").into(),
            token,
            delete_interface: parse_bool(&get("delete_interface")),
            delete_client: parse_bool(&get("delete_client")),
            whitelist_ip_access,
        })
    }
}

fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.to_ascii_lowercase().as_str(),
        "true" | "yes" | "on" | "1"
    )
}
