//! `forged certs` — bootstrap the mutual-TLS material.
//!
//! Writes into one directory:
//!
//! | file                          | used by                          |
//! |-------------------------------|----------------------------------|
//! | `ca.pem`                      | agent (`--ca-file`), control     |
//! | `ca.key`                      | later runs issuing more nodes    |
//! | `agent.pem` / `agent.key`     | agent (`--cert-file/--key-file`) |
//! | `control.pem` / `control.key` | control (`node add --client-*`)  |
//!
//! When `ca.key` already exists the CA is reused, so certificates for
//! additional nodes chain to the `ca.pem` that is already deployed.

use std::path::Path;

use anyhow::{Context, bail};
use forgegrid_agent::tls::CertificateAuthority;
use tracing::info;

use crate::CertsArgs;

const CA_CERT: &str = "ca.pem";
const CA_KEY: &str = "ca.key";

pub fn run(args: CertsArgs) -> anyhow::Result<()> {
    let dir = args.out_dir.as_path();
    let sans = if args.sans.is_empty() {
        vec!["localhost".to_string(), "127.0.0.1".to_string()]
    } else {
        args.sans
    };

    let agent_cert = dir.join("agent.pem");
    let client_cert = dir.join(format!("{}.pem", args.client_name));
    if !args.force {
        for path in [&agent_cert, &client_cert] {
            if path.exists() {
                bail!("{} already exists, pass --force to overwrite", path.display());
            }
        }
    }

    let ca = load_or_generate_ca(dir)?;
    ca.issue_server(&args.node_id, &sans)?
        .write(&agent_cert, &dir.join("agent.key"))?;
    ca.issue_client(&args.client_name)?
        .write(&client_cert, &dir.join(format!("{}.key", args.client_name)))?;

    info!(dir = %dir.display(), node_id = %args.node_id, sans = ?sans, "certificates written");
    println!("certificates written to {}", dir.display());
    Ok(())
}

fn load_or_generate_ca(dir: &Path) -> anyhow::Result<CertificateAuthority> {
    let key_path = dir.join(CA_KEY);
    if key_path.exists() {
        let key_pem = std::fs::read_to_string(&key_path)
            .with_context(|| format!("reading {}", key_path.display()))?;
        info!(path = %key_path.display(), "reusing existing CA");
        return CertificateAuthority::from_key_pem(&key_pem);
    }
    let ca = CertificateAuthority::generate()?;
    ca.pair().write(&dir.join(CA_CERT), &key_path)?;
    Ok(ca)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn args(dir: &Path, node_id: &str, force: bool) -> CertsArgs {
        CertsArgs {
            out_dir: dir.to_path_buf(),
            node_id: node_id.to_string(),
            sans: vec!["node.example.net".to_string()],
            client_name: "control".to_string(),
            force,
        }
    }

    fn read(dir: &Path, name: &str) -> String {
        std::fs::read_to_string(dir.join(name)).unwrap()
    }

    #[test]
    fn writes_full_set() {
        let dir = tempfile::tempdir().unwrap();
        run(args(dir.path(), "node-1", false)).unwrap();
        for name in ["ca.pem", "ca.key", "agent.pem", "agent.key", "control.pem", "control.key"] {
            assert!(dir.path().join(name).exists(), "{name} missing");
        }
        assert!(read(dir.path(), "agent.pem").contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn refuses_to_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        run(args(dir.path(), "node-1", false)).unwrap();
        let err = run(args(dir.path(), "node-1", false)).unwrap_err();
        assert!(err.to_string().contains("--force"));
    }

    #[test]
    fn reruns_keep_the_ca() {
        let dir = tempfile::tempdir().unwrap();
        run(args(dir.path(), "node-1", false)).unwrap();
        let ca = read(dir.path(), "ca.pem");
        let first_agent = read(dir.path(), "agent.pem");

        run(args(dir.path(), "node-2", true)).unwrap();
        assert_eq!(read(dir.path(), "ca.pem"), ca);
        assert_ne!(read(dir.path(), "agent.pem"), first_agent);
    }

    #[test]
    fn unreadable_ca_key_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CA_KEY), "garbage").unwrap();
        assert!(load_or_generate_ca(&PathBuf::from(dir.path())).is_err());
    }
}
