use crate::config::ServerConfig;
use crate::Error;
use anyhow::bail;
use std::{fs::File, io::BufReader, path::Path, sync::Arc};
use tokio_rustls::rustls::{self, Certificate, PrivateKey};

/// Builds the TLS acceptor configuration: the configured PEM pair when it
/// loads, a freshly generated self-signed certificate otherwise.
pub fn server_config(cfg: &ServerConfig) -> Result<Arc<rustls::ServerConfig>, Error> {
    let (certs, key) = match load_keypair(&cfg.tls_public, &cfg.tls_private) {
        Ok(pair) => pair,
        Err(e) => {
            log::warn!("Cannot load TLS certificates ({e}). Created and using self-signed");
            self_signed()?
        }
    };

    let config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

fn load_keypair(
    public_path: &Path,
    private_path: &Path,
) -> Result<(Vec<Certificate>, PrivateKey), Error> {
    let mut reader = BufReader::new(File::open(public_path)?);
    let certs: Vec<Certificate> = rustls_pemfile::certs(&mut reader)?
        .into_iter()
        .map(Certificate)
        .collect();
    if certs.is_empty() {
        bail!("no certificates in {}", public_path.display());
    }
    Ok((certs, load_private_key(private_path)?))
}

fn load_private_key(path: &Path) -> Result<PrivateKey, Error> {
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(File::open(path)?))?;
    if let Some(key) = keys.pop() {
        return Ok(PrivateKey(key));
    }
    let mut keys = rustls_pemfile::rsa_private_keys(&mut BufReader::new(File::open(path)?))?;
    if let Some(key) = keys.pop() {
        return Ok(PrivateKey(key));
    }
    let mut keys = rustls_pemfile::ec_private_keys(&mut BufReader::new(File::open(path)?))?;
    if let Some(key) = keys.pop() {
        return Ok(PrivateKey(key));
    }
    bail!("no private key in {}", path.display())
}

fn self_signed() -> Result<(Vec<Certificate>, PrivateKey), Error> {
    let cert = rcgen::generate_simple_self_signed(vec!["wgpanel".to_string()])?;
    let key = PrivateKey(cert.serialize_private_key_der());
    Ok((vec![Certificate(cert.serialize_der()?)], key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config_with(public: &Path, private: &Path) -> ServerConfig {
        ServerConfig {
            ip_port: "127.0.0.1:8443".to_string(),
            tls_private: private.to_path_buf(),
            tls_public: public.to_path_buf(),
            database: "/tmp/unused.db".into(),
            token: "t".to_string(),
            delete_interface: false,
            delete_client: false,
            whitelist_ip_access: Vec::new(),
        }
    }

    #[test]
    fn test_missing_files_fall_back_to_self_signed() {
        let cfg = config_with(Path::new("/nonexistent/cert.pem"), Path::new("/nonexistent/key.pem"));
        server_config(&cfg).unwrap();
    }

    #[test]
    fn test_garbage_files_fall_back_to_self_signed() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        File::create(&cert_path)
            .unwrap()
            .write_all(b"not a pem")
            .unwrap();
        File::create(&key_path)
            .unwrap()
            .write_all(b"not a pem")
            .unwrap();

        let cfg = config_with(&cert_path, &key_path);
        server_config(&cfg).unwrap();
    }

    #[test]
    fn test_generated_pair_loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");

        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        File::create(&cert_path)
            .unwrap()
            .write_all(cert.serialize_pem().unwrap().as_bytes())
            .unwrap();
        File::create(&key_path)
            .unwrap()
            .write_all(cert.serialize_private_key_pem().as_bytes())
            .unwrap();

        let cfg = config_with(&cert_path, &key_path);
        server_config(&cfg).unwrap();
    }
}
