//! Certificates and TLS configuration.
//!
//! Generates the CA, agent server certificates and control-plane client
//! certificates used for mutual TLS, and turns PEM files on disk into a
//! rustls server configuration that only speaks TLS 1.3 and requires a
//! client certificate signed by the configured CA.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType,
};
use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use tracing::info;

/// A generated certificate and private key pair.
#[derive(Debug, Clone)]
pub struct CertKeyPair {
    /// PEM-encoded certificate.
    pub cert_pem: String,
    /// PEM-encoded private key.
    pub key_pem: String,
}

impl CertKeyPair {
    /// Write both halves, creating parent directories as needed.
    pub fn write(&self, cert_path: &Path, key_path: &Path) -> anyhow::Result<()> {
        write_pem(cert_path, &self.cert_pem)?;
        write_pem(key_path, &self.key_pem)?;
        restrict_permissions(key_path)?;
        Ok(())
    }
}

fn write_pem(path: &Path, pem: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    fs::write(path, pem).with_context(|| format!("writing {}", path.display()))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .with_context(|| format!("restricting {}", path.display()))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> anyhow::Result<()> {
    Ok(())
}

/// Self-signed CA that issues every certificate of a deployment.
pub struct CertificateAuthority {
    cert: rcgen::Certificate,
    key: KeyPair,
}

impl CertificateAuthority {
    pub fn generate() -> anyhow::Result<Self> {
        let key = KeyPair::generate()?;
        let cert = ca_params().self_signed(&key)?;
        info!("generated CA certificate");
        Ok(Self { cert, key })
    }

    /// Rebuild the CA from its persisted private key.
    ///
    /// The certificate is re-signed with the same subject and key, so
    /// leaves it issues chain to the originally distributed `ca.pem`.
    pub fn from_key_pem(key_pem: &str) -> anyhow::Result<Self> {
        let key = KeyPair::from_pem(key_pem).context("parsing CA key")?;
        let cert = ca_params().self_signed(&key)?;
        Ok(Self { cert, key })
    }

    pub fn pair(&self) -> CertKeyPair {
        CertKeyPair {
            cert_pem: self.cert.pem(),
            key_pem: self.key.serialize_pem(),
        }
    }

    /// Server certificate for an agent, valid for `addresses` (IPs or DNS
    /// names).
    pub fn issue_server(&self, node_id: &str, addresses: &[String]) -> anyhow::Result<CertKeyPair> {
        let mut params = leaf_params(node_id)?;
        for addr in addresses {
            let san = match addr.parse::<std::net::IpAddr>() {
                Ok(ip) => SanType::IpAddress(ip),
                Err(_) => SanType::DnsName(addr.clone().try_into()?),
            };
            params.subject_alt_names.push(san);
        }
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let pair = self.sign(params)?;
        info!(%node_id, sans = addresses.len(), "issued server certificate");
        Ok(pair)
    }

    /// Client certificate presented by the control plane.
    pub fn issue_client(&self, name: &str) -> anyhow::Result<CertKeyPair> {
        let mut params = leaf_params(name)?;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let pair = self.sign(params)?;
        info!(%name, "issued client certificate");
        Ok(pair)
    }

    fn sign(&self, params: CertificateParams) -> anyhow::Result<CertKeyPair> {
        let key = KeyPair::generate()?;
        let cert = params.signed_by(&key, &self.cert, &self.key)?;
        Ok(CertKeyPair {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }
}

fn ca_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "forgegrid");
    dn.push(DnType::CommonName, "forgegrid CA");
    params.distinguished_name = dn;

    // Valid for 10 years.
    params.not_after = rcgen::date_time_ymd(2036, 1, 1);
    params
}

fn leaf_params(common_name: &str) -> anyhow::Result<CertificateParams> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "forgegrid");
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.not_after = rcgen::date_time_ymd(2031, 1, 1);
    Ok(params)
}

/// Paths of the agent's PEM material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
    /// CA that client certificates must chain to.
    pub ca: PathBuf,
}

pub fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let pem = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parsing certificates in {}", path.display()))?;
    anyhow::ensure!(!certs.is_empty(), "no certificates in {}", path.display());
    Ok(certs)
}

pub fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let pem = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .with_context(|| format!("parsing private key in {}", path.display()))?
        .with_context(|| format!("no private key in {}", path.display()))
}

/// Install ring as the process-wide rustls provider. Later calls are no-ops.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// TLS 1.3-only server configuration requiring client certificates
/// signed by `files.ca`.
pub fn server_config(files: &TlsFiles) -> anyhow::Result<Arc<rustls::ServerConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut roots = RootCertStore::empty();
    for ca in load_certs(&files.ca)? {
        roots.add(ca).context("adding CA certificate")?;
    }
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
        .context("building client certificate verifier")?;

    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("selecting TLS 1.3")?
        .with_client_cert_verifier(verifier)
        .with_single_cert(load_certs(&files.cert)?, load_key(&files.key)?)
        .context("loading server certificate")?;
    config.alpn_protocols = vec![b"h2".to_vec()];
    Ok(Arc::new(config))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// CA, server and client material written under `dir`.
    pub(crate) struct Fixture {
        pub server: TlsFiles,
        pub client_cert: PathBuf,
        pub client_key: PathBuf,
    }

    pub(crate) fn write_fixture(dir: &Path) -> Fixture {
        let ca = CertificateAuthority::generate().unwrap();
        let ca_path = dir.join("ca.pem");
        write_pem(&ca_path, &ca.pair().cert_pem).unwrap();

        let server = ca
            .issue_server("node-1", &["localhost".to_string(), "127.0.0.1".to_string()])
            .unwrap();
        server
            .write(&dir.join("server.pem"), &dir.join("server.key"))
            .unwrap();

        let client = ca.issue_client("control").unwrap();
        client
            .write(&dir.join("client.pem"), &dir.join("client.key"))
            .unwrap();

        Fixture {
            server: TlsFiles {
                cert: dir.join("server.pem"),
                key: dir.join("server.key"),
                ca: ca_path,
            },
            client_cert: dir.join("client.pem"),
            client_key: dir.join("client.key"),
        }
    }

    #[test]
    fn generate_ca_succeeds() {
        let pair = CertificateAuthority::generate().unwrap().pair();
        assert!(pair.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(pair.key_pem.contains("BEGIN PRIVATE KEY"));
    }

    #[test]
    fn issued_certs_differ_from_ca() {
        let ca = CertificateAuthority::generate().unwrap();
        let server = ca
            .issue_server("node-2", &["192.168.1.100".to_string(), "node2.local".to_string()])
            .unwrap();
        let client = ca.issue_client("control").unwrap();
        assert!(server.cert_pem.contains("BEGIN CERTIFICATE"));
        assert_ne!(server.cert_pem, ca.pair().cert_pem);
        assert_ne!(server.cert_pem, client.cert_pem);
    }

    #[test]
    fn reloaded_ca_keeps_its_key() {
        let ca = CertificateAuthority::generate().unwrap();
        let reloaded = CertificateAuthority::from_key_pem(&ca.pair().key_pem).unwrap();
        assert_eq!(reloaded.pair().key_pem, ca.pair().key_pem);
        assert!(CertificateAuthority::from_key_pem("not a key").is_err());
    }

    #[test]
    fn server_config_from_written_files() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = write_fixture(dir.path());
        let config = server_config(&fixture.server).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec()]);
        assert_eq!(load_certs(&fixture.client_cert).unwrap().len(), 1);
        load_key(&fixture.client_key).unwrap();
    }

    #[test]
    fn missing_files_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_certs(&dir.path().join("absent.pem")).unwrap_err();
        assert!(err.to_string().contains("absent.pem"));
    }
}
