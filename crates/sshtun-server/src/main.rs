//! sshtun: SSH rendezvous host for reverse port forwarding.
//!
//! Agents authenticate with a public key, receive a session token and ask for
//! reverse forwards; clients log in with that token as password and reach the
//! agent's side through the forwarded ports.

mod config;
mod server;
mod ssh;

use anyhow::{Context, Result};
use clap::Parser;
use config::{Overrides, ServerConfig};
use server::TunnelServer;
use sshtun_core::{
    AcceptAnyKey, Authenticator, AuthorizedKeySet, ConnectionHandler, Dialer, KeyVerifier,
    RateLimiter, RouteManager, TokenBroker,
};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// sshtun: SSH reverse-tunnel relay
#[derive(Parser, Debug)]
#[command(name = "sshtun", version, about = "SSH reverse-tunnel relay")]
struct Cli {
    /// Address to listen on
    #[arg(long)]
    bind_ip: Option<IpAddr>,

    /// Port to listen on
    #[arg(long)]
    bind_port: Option<u16>,

    /// Source address for outbound direct-tcpip connections
    #[arg(long)]
    peer_ip: Option<IpAddr>,

    /// Host private key (OpenSSH format)
    #[arg(long)]
    server_key: Option<String>,

    /// Restrict agents to the keys in this authorized_keys file
    #[arg(long)]
    authorized_keys: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.sshtun/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    if let Err(e) = run(cli).await {
        error!(error = %format!("{e:#}"), "sshtun failed");
        std::process::exit(1);
    }
    info!("sshtun stopped");
}

async fn run(cli: Cli) -> Result<()> {
    let overrides = Overrides {
        bind_ip: cli.bind_ip,
        bind_port: cli.bind_port,
        peer_ip: cli.peer_ip,
        host_key: cli.server_key,
        authorized_keys: cli.authorized_keys,
    };
    let config = ServerConfig::load(Some(&PathBuf::from(&cli.config)), overrides)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind_ip = %config.bind_ip,
        bind_port = config.bind_port,
        "starting sshtun"
    );

    let host_key = russh_keys::load_secret_key(&config.host_key, None)
        .with_context(|| format!("cannot load host key {}", config.host_key.display()))?;

    let verifier: Box<dyn KeyVerifier> = match &config.authorized_keys {
        Some(path) => Box::new(AuthorizedKeySet::load(path)?),
        None => Box::new(AcceptAnyKey),
    };
    if config.authorized_keys.is_none() {
        warn!("agent public keys are not verified; set auth.authorized_keys to restrict agents");
    }
    info!(
        agent_user = %config.agent_user,
        policy = %verifier.describe(),
        "agent key policy"
    );

    let broker = Arc::new(TokenBroker::new());
    let routes = Arc::new(RouteManager::new());
    let auth = Arc::new(Authenticator::new(
        config.agent_user.clone(),
        verifier,
        broker.clone(),
        RateLimiter::new(config.max_attempts, config.window_secs),
    ));
    let handler = ConnectionHandler::new(
        routes.clone(),
        broker,
        Dialer::new(config.peer_ip, config.dial_timeout),
    );

    let ssh_config = russh::server::Config {
        keys: vec![host_key],
        methods: russh::MethodSet::PUBLICKEY | russh::MethodSet::PASSWORD,
        auth_rejection_time: std::time::Duration::from_secs(1),
        inactivity_timeout: Some(config.inactivity_timeout),
        ..Default::default()
    };

    let listener = TunnelServer::bind(SocketAddr::new(config.bind_ip, config.bind_port)).await?;
    let server = TunnelServer::new(ssh_config, auth, handler);

    let result = tokio::select! {
        result = server.run(listener) => result,
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            Ok(())
        }
    };

    routes.shutdown().await;
    result
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
