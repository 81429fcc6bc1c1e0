use serde::{Deserialize, Serialize};

pub mod client;
pub mod interface;
pub mod rules;

// Response payloads. Field names are part of the wire format and match the
// deployed clients, typos included.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInterface {
    pub ifname: String,
    pub ip: String,
    pub port: u16,
    pub private: String,
    pub public: String,
    pub endpoint: String,
    pub config: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerArchiveEntry {
    pub ifname: String,
    pub ip: String,
    pub port: u16,
    pub private: String,
    pub public: String,
    pub endpoint: String,
    pub deleted_at: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingStatus {
    pub status: bool,
    pub ping_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientResponse {
    pub ifname: String,
    pub private: String,
    pub public: String,
    pub ip: String,
    #[serde(rename = "alloweip")]
    pub allowed_ips: String,
    pub config: String,
    pub ping_status: PingStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientArchiveEntry {
    pub ifname: String,
    pub private: String,
    pub public: String,
    pub ip: String,
    #[serde(rename = "alloweip")]
    pub allowed_ips: String,
    pub config: String,
    pub deleted_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowedIpEntry {
    pub ip: String,
    pub mask: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerStatus {
    pub public: String,
    /// Unix seconds of the last completed handshake, 0 when there was none.
    pub handshake: u64,
    #[serde(rename = "reciev")]
    pub received: u64,
    #[serde(rename = "trasmit")]
    pub transmitted: u64,
    #[serde(rename = "alloweip")]
    pub allowed_ips: Vec<AllowedIpEntry>,
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceStatus {
    pub ifname: String,
    pub status: Vec<PeerStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardReport {
    pub bytes: String,
    pub source: String,
    pub destination: String,
    pub protocol: String,
    pub position: u32,
    pub action: String,
    pub port: String,
    pub comment: String,
    #[serde(rename = "list")]
    pub is_list: bool,
    pub except: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasqueradeReport {
    pub ifname: String,
    pub source: String,
    pub comment: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesReport {
    pub forward: Vec<ForwardReport>,
    pub masquerade: Vec<MasqueradeReport>,
    #[serde(rename = "interfaces")]
    pub interface_list: Vec<String>,
}
