//! `forged agent` — serve the agent RPCs for one node.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use forgegrid_agent::engine::{ContainerEngine, DockerEngine, MemoryEngine};
use forgegrid_agent::tls::TlsFiles;
use forgegrid_agent::{AgentConfig, AgentServer, AuthMode, LifecycleConfig, LifecycleManager, auth};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::{AgentArgs, EngineKind};

/// Settings assembled from flags and environment.
fn agent_config(args: AgentArgs) -> AgentConfig {
    let auth = if args.insecure {
        AuthMode::SharedToken(args.token)
    } else {
        if args.token.is_some() {
            warn!("--token is ignored when mutual TLS is enabled");
        }
        AuthMode::MutualTls(TlsFiles {
            cert: args.cert_file,
            key: args.key_file,
            ca: args.ca_file,
        })
    };

    let mut lifecycle = LifecycleConfig::new(args.data_root)
        .with_stop_timeout(Duration::from_secs(args.stop_timeout));
    if let Some(image) = args.default_image {
        lifecycle = lifecycle.with_default_image(image);
    }
    AgentConfig::new(args.node_id, args.listen, auth).with_lifecycle(lifecycle)
}

pub async fn run(args: AgentArgs) -> anyhow::Result<()> {
    let engine: Arc<dyn ContainerEngine> = match args.engine {
        EngineKind::Docker => Arc::new(DockerEngine::connect().context("connecting to Docker")?),
        EngineKind::Memory => {
            warn!("using the in-memory engine, no containers will run");
            Arc::new(MemoryEngine::new())
        }
    };
    let config = agent_config(args);

    tokio::fs::create_dir_all(&config.lifecycle.data_root)
        .await
        .with_context(|| format!("creating {}", config.lifecycle.data_root.display()))?;

    // ── Engine probe ──────────────────────────────────────────────
    match engine.info().await {
        Ok(info) => info!(
            cores = info.cpu_cores,
            memory_mb = info.memory_total_bytes / (1024 * 1024),
            "container engine ready"
        ),
        Err(e) => warn!(error = %e, "container engine not reachable yet"),
    }

    let lifecycle = Arc::new(LifecycleManager::new(engine, config.lifecycle.clone()));

    // Containers survive agent restarts; rebuild the cache from their labels.
    match lifecycle.list().await {
        Ok(workloads) => info!(workloads = workloads.len(), "recovered workloads from engine"),
        Err(e) => warn!(error = %e, "could not list existing workloads"),
    }

    // ── Serve ─────────────────────────────────────────────────────
    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;
    info!(
        node_id = %config.node_id,
        addr = %config.listen,
        data_root = %config.lifecycle.data_root.display(),
        image = %config.lifecycle.default_image,
        "starting forged agent"
    );

    let server = AgentServer::new(config.node_id.clone(), lifecycle);
    auth::serve(listener, server, config.auth, crate::shutdown_signal()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn parse(extra: &[&str]) -> AgentArgs {
        let mut argv = vec!["forged", "agent", "--node-id", "node-7"];
        argv.extend_from_slice(extra);
        match crate::Cli::try_parse_from(argv).unwrap().command {
            crate::Command::Agent(args) => args,
            _ => panic!("expected agent command"),
        }
    }

    #[test]
    fn secure_by_default() {
        let config = agent_config(parse(&["--ca-file", "/tmp/ca.pem", "--token", "ignored"]));
        assert_eq!(config.node_id, "node-7");
        match config.auth {
            AuthMode::MutualTls(files) => assert_eq!(files.ca, std::path::PathBuf::from("/tmp/ca.pem")),
            other => panic!("unexpected auth mode: {other:?}"),
        }
    }

    #[test]
    fn insecure_uses_the_token() {
        let config = agent_config(parse(&["--insecure", "--token", "s3cret", "--stop-timeout", "5"]));
        assert_eq!(config.lifecycle.stop_timeout, Duration::from_secs(5));
        assert!(matches!(config.auth, AuthMode::SharedToken(Some(ref t)) if t == "s3cret"));
    }

    #[test]
    fn default_image_override() {
        let config = agent_config(parse(&["--default-image", "game:1.21", "--data-root", "/srv/fg"]));
        assert_eq!(config.lifecycle.default_image, "game:1.21");
        assert_eq!(config.lifecycle.data_root, std::path::PathBuf::from("/srv/fg"));
        assert_eq!(config.lifecycle.stop_timeout, Duration::from_secs(30));
    }
}
