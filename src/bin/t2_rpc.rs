use std::{net::{IpAddr, Ipv4Addr, SocketAddr}, path::PathBuf, time::Duration};
use clap::{command, Parser, Subcommand};
use t2_rpc::prelude::*;
use t2_rpc::transport::udp;
use t2_rpc::DEFAULT_PORT;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version = "1.0", author = "Felix Watts", about = "Serve and call t2 RPC endpoints over UDP.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the demo methods
    Serve {
        #[arg(short, long, default_value_t = default_addr())]
        addr: SocketAddr,
        /// JSON endpoint config
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Call a method and print the result as JSON
    Call {
        #[arg(short, long, default_value_t = default_addr())]
        addr: SocketAddr,
        #[arg(short, long)]
        method: String,
        /// Positional arguments as a JSON array
        #[arg(long, default_value = "[]")]
        args: String,
        /// Keyword arguments as a JSON object
        #[arg(long, default_value = "{}")]
        kwargs: String,
        /// Seconds, 0 waits forever
        #[arg(short, long, default_value_t = 5.0)]
        timeout: f64,
    },
    Ping {
        #[arg(short, long, default_value_t = default_addr())]
        addr: SocketAddr,
        #[arg(short, long, default_value_t = 1.0)]
        timeout: f64,
    },
    /// Ask an endpoint to exit
    Shutdown {
        #[arg(short, long, default_value_t = default_addr())]
        addr: SocketAddr,
        #[arg(long)]
        token: Option<String>,
    },
}

fn default_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), DEFAULT_PORT)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run().await {
        eprintln!("{}", &e.to_string());
        std::process::exit(1);
    }
}

async fn run() -> RpcResult<()> {
    let command = Cli::parse();
    match command.command {
        Commands::Serve { addr, config } => {
            let config = match config {
                Some(path) => EndpointConfig::from_json_file(path)?,
                None => EndpointConfig::default(),
            };
            let transport = udp::bind(addr).await?;
            log::info!("Serving on {}", transport.local_addr()?);
            let (_endpoint, stopper) = EndpointBuilder::new()
                .config(config)
                .resolver(demo_registry()?)
                .start(transport)?;
            stopper.join().await?;
        },
        Commands::Call { addr, method, args, kwargs, timeout } => {
            let args: Vec<Value> = serde_json::from_str(&args)
                .map_err(|e| RpcError::ConfigError(format!("--args: {}", e)))?;
            let kwargs: Kwargs = serde_json::from_str(&kwargs)
                .map_err(|e| RpcError::ConfigError(format!("--kwargs: {}", e)))?;
            let (endpoint, stopper) = connect(addr, EndpointConfig::default()).await?;
            let result = endpoint.call(addr, &method, args, kwargs, seconds(timeout)?).await;
            stopper.stop().await?;
            println!("{}", serde_json::to_string_pretty(&result?)?);
        },
        Commands::Ping { addr, timeout } => {
            let (endpoint, stopper) = connect(addr, EndpointConfig::default()).await?;
            let alive = endpoint.ping(addr, seconds(timeout)?).await;
            stopper.stop().await?;
            println!("{}", if alive? { "alive" } else { "no answer" });
        },
        Commands::Shutdown { addr, token } => {
            let config = EndpointConfig { admin_token: token, ..EndpointConfig::default() };
            let (endpoint, stopper) = connect(addr, config).await?;
            let result = endpoint.shutdown(addr).await;
            stopper.stop().await?;
            result?;
        },
    }

    Ok(())
}

/// Start a pure client endpoint on an ephemeral port able to reach `peer`.
async fn connect(peer: SocketAddr, config: EndpointConfig) -> RpcResult<(Endpoint<SocketAddr>, EndpointStopper<SocketAddr>)> {
    let local: SocketAddr = match peer {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let transport = udp::bind(local).await?;
    EndpointBuilder::new().config(config).start(transport)
}

fn seconds(timeout: f64) -> RpcResult<Duration> {
    Duration::try_from_secs_f64(timeout)
        .map_err(|e| RpcError::ConfigError(format!("--timeout: {}", e)))
}

fn binary_op(inv: &Invocation, int_op: fn(i64, i64) -> Option<i64>, float_op: fn(f64, f64) -> f64) -> HandlerResult {
    if let (Ok(a), Ok(b)) = (inv.arg::<i64>(0), inv.arg::<i64>(1)) {
        if let Some(result) = int_op(a, b) {
            return Ok(result.into());
        }
    }
    Ok(float_op(inv.arg::<f64>(0)?, inv.arg::<f64>(1)?).into())
}

fn demo_registry() -> RpcResult<Registry> {
    let mut math = Registry::new();
    math.register_blocking("add", |inv| binary_op(&inv, i64::checked_add, |a, b| a + b))?;
    math.register_blocking("mul", |inv| binary_op(&inv, i64::checked_mul, |a, b| a * b))?;

    let mut registry = Registry::new();
    registry.mount("math", math)?;
    registry.register_blocking("echo", |inv| {
        Ok(serde_json::json!({ "args": inv.args, "kwargs": inv.kwargs }))
    })?;
    // dropped at the sleep if the caller cancels
    registry.register_async("sys.sleep", |inv| async move {
        let seconds: f64 = inv.arg(0)?;
        let duration = Duration::try_from_secs_f64(seconds)
            .map_err(|e| HandlerError::new("ValueError", e.to_string()))?;
        tokio::time::sleep(duration).await;
        HandlerResult::Ok(Value::from(seconds))
    })?;

    let mut methods = registry.methods();
    methods.push("sys.methods".to_string());
    methods.sort();
    registry.register_blocking("sys.methods", move |_| Ok(Value::from(methods.clone())))?;

    Ok(registry)
}
