//! Portgate CLI
//!
//! One binary, two roles: `portgate relay` runs the public relay server,
//! `portgate http`/`portgate tcp` runs the agent next to a local service.
//! `portgate generate-token` mints JWTs for relays configured with
//! `--jwt-secret`.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use portgate_client::{Agent, AgentConfig, AgentError, ReconnectConfig};
use portgate_proto::Protocol;
use portgate_relay::{
    AdmissionChain, AdmissionGate, CidrBlocklistGate, JwtResolver, RelayConfig, RelayServer,
    ResolvePrincipal, SlidingWindowGate, StaticTokenResolver,
};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Expose a local service to the internet through a public relay
#[derive(Parser, Debug)]
#[command(name = "portgate")]
#[command(about = "Expose local services through a public relay")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay server
    Relay(RelayArgs),

    /// Tunnel a local HTTP service
    Http(TunnelArgs),

    /// Tunnel a local TCP service
    Tcp(TunnelArgs),

    /// Mint a JWT for relays running with --jwt-secret
    GenerateToken {
        /// Signing secret (must match the relay's --jwt-secret)
        #[arg(long, env = "PORTGATE_JWT_SECRET")]
        secret: String,

        /// Principal name embedded in the token
        #[arg(long, default_value = "default")]
        principal: String,

        /// Token validity in hours
        #[arg(long, default_value = "24")]
        hours: i64,
    },
}

#[derive(Args, Debug)]
struct RelayArgs {
    /// Address the control listener and all public listeners bind to
    #[arg(long, env = "PORTGATE_BIND", default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Port agents connect to
    #[arg(long, env = "PORTGATE_CONTROL_PORT", default_value = "7000")]
    control_port: u16,

    /// Hostname advertised to agents in public URLs
    #[arg(long, env = "PORTGATE_PUBLIC_HOST", default_value = "127.0.0.1")]
    public_host: String,

    /// Public port ranges, e.g. "20000-25000,30000-35000"
    #[arg(long, env = "PORTGATE_PORT_RANGES")]
    port_ranges: Option<String>,

    /// Accepted agent token as "principal:token" (repeatable); a bare
    /// token maps to the "default" principal
    #[arg(long = "token")]
    tokens: Vec<String>,

    /// Validate agent tokens as HS256 JWTs instead of a static list
    #[arg(long, env = "PORTGATE_JWT_SECRET", conflicts_with = "tokens")]
    jwt_secret: Option<String>,

    /// Seconds to wait for an agent to answer a relayed HTTP request
    #[arg(long, default_value = "30")]
    request_deadline: u64,

    /// Public requests allowed per source IP per window
    #[arg(long, default_value = "100")]
    rate_limit: usize,

    /// Public rate limit window in seconds
    #[arg(long, default_value = "900")]
    rate_window: u64,

    /// Registrations allowed per agent IP per hour
    #[arg(long, default_value = "10")]
    register_limit: usize,

    /// CIDR prefix to refuse outright (repeatable), e.g. "203.0.113.0/24"
    #[arg(long = "block")]
    blocked: Vec<String>,
}

#[derive(Args, Debug)]
struct TunnelArgs {
    /// Port of the local service to expose
    #[arg(long, env = "PORTGATE_LOCAL_PORT")]
    local_port: u16,

    /// Host of the local service
    #[arg(long, env = "PORTGATE_LOCAL_HOST", default_value = "localhost")]
    local_host: String,

    /// Ask the relay for this public port (best effort)
    #[arg(long, short)]
    port: Option<u16>,

    /// Relay control address, host:port
    #[arg(long, env = "PORTGATE_RELAY")]
    relay: String,

    /// Authentication token
    #[arg(long, env = "PORTGATE_TOKEN")]
    token: String,

    /// Name for this tunnel, used in log output
    #[arg(long)]
    name: Option<String>,

    /// Connection attempts before giving up (0 = retry forever)
    #[arg(long, default_value = "5")]
    max_reconnect_attempts: usize,

    /// Initial reconnection delay in seconds
    #[arg(long, default_value = "1")]
    reconnect_delay: u64,

    /// Maximum reconnection delay in seconds
    #[arg(long, default_value = "5")]
    max_reconnect_delay: u64,
}

fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

async fn run_relay(args: RelayArgs) -> Result<()> {
    let mut config = RelayConfig {
        bind_addr: args.bind,
        control_port: args.control_port,
        public_host: args.public_host,
        request_deadline: Duration::from_secs(args.request_deadline),
        ..RelayConfig::default()
    };
    if let Some(ranges) = &args.port_ranges {
        config.port_ranges = RelayConfig::parse_port_ranges(ranges)
            .map_err(|e| anyhow::anyhow!("--port-ranges: {e}"))?;
    }

    let resolver: Arc<dyn ResolvePrincipal> = match &args.jwt_secret {
        Some(secret) => {
            info!("agent authentication: JWT (HS256)");
            Arc::new(JwtResolver::new(secret.as_bytes()))
        }
        None => {
            if args.tokens.is_empty() {
                warn!("no --token or --jwt-secret given; every registration will be refused");
            } else {
                info!(tokens = args.tokens.len(), "agent authentication: static token list");
            }
            Arc::new(StaticTokenResolver::from_specs(&args.tokens))
        }
    };

    let blocklist =
        CidrBlocklistGate::new(&args.blocked).map_err(|e| anyhow::anyhow!("--block: {e}"))?;
    let public_gate: Arc<dyn AdmissionGate> = Arc::new(AdmissionChain::new(vec![
        Arc::new(blocklist),
        Arc::new(SlidingWindowGate::new(
            args.rate_limit,
            Duration::from_secs(args.rate_window),
        )),
    ]));
    let register_gate: Arc<dyn AdmissionGate> = Arc::new(SlidingWindowGate::new(
        args.register_limit,
        Duration::from_secs(3600),
    ));

    info!("🚀 portgate relay starting");
    info!("control: {}", config.control_addr());
    info!("public host: {}", config.public_host);
    for range in &config.port_ranges {
        info!("public ports: {}-{}", range.start(), range.end());
    }

    let server = RelayServer::new(config)
        .with_resolver(resolver)
        .with_public_gate(public_gate)
        .with_register_gate(register_gate);
    let shutdown = server.shutdown_handle();
    let join = tokio::spawn(server.run());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("ctrl-c received, shutting down");
    shutdown.shutdown();

    join.await?.context("relay server failed")
}

async fn run_tunnel(protocol: Protocol, args: TunnelArgs) -> Result<()> {
    let config = AgentConfig::builder()
        .relay_addr(args.relay)
        .auth_token(args.token)
        .protocol(protocol)
        .local_host(args.local_host)
        .local_port(args.local_port)
        .preferred_port(args.port)
        .reconnect(ReconnectConfig {
            initial_delay: Duration::from_secs(args.reconnect_delay),
            max_delay: Duration::from_secs(args.max_reconnect_delay),
            multiplier: 2.0,
            max_attempts: (args.max_reconnect_attempts > 0).then_some(args.max_reconnect_attempts),
        })
        .build()
        .map_err(|e| anyhow::anyhow!(e))?;

    if let Some(name) = &args.name {
        info!(tunnel = %name, "starting {} tunnel for {}", protocol, config.local_target());
    } else {
        info!("starting {} tunnel for {}", protocol, config.local_target());
    }

    let agent = Agent::new(config);
    let shutdown = agent.shutdown_handle();
    let mut join = tokio::spawn(async move { agent.run().await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received, closing tunnel");
            shutdown.shutdown();
            let _ = join.await?;
            Ok(())
        }
        result = &mut join => match result? {
            Ok(()) => Ok(()),
            Err(e @ AgentError::Rejected(_)) => {
                error!("{e}");
                Err(e.into())
            }
            Err(e) => {
                error!("tunnel failed: {e}");
                Err(e.into())
            }
        },
    }
}

fn generate_token(secret: &str, principal: &str, hours: i64) -> Result<()> {
    let token = JwtResolver::issue(secret.as_bytes(), principal, chrono::Duration::hours(hours))
        .context("failed to sign token")?;

    println!("✅ token for principal '{principal}', valid {hours}h:\n");
    println!("{token}\n");
    println!("Usage:");
    println!(
        "  portgate http --local-port 3000 --relay relay.example.com:7000 --token \"{token}\""
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Relay(args) => run_relay(args).await,
        Commands::Http(args) => run_tunnel(Protocol::Http, args).await,
        Commands::Tcp(args) => run_tunnel(Protocol::Tcp, args).await,
        Commands::GenerateToken {
            secret,
            principal,
            hours,
        } => generate_token(&secret, &principal, hours),
    }
}
