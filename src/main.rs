//! acomm CLI - serve tasks, issue requests, fetch streams.
//!
//! See the `acomm` library for the transport and correlation layers.

use std::path::PathBuf;
use std::time::Duration;

use acomm::{open_stream, Config, EchoHandler, Request, TaskServer, Tracker};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;

// CLI
#[derive(Parser)]
#[command(name = "acomm")]
#[command(version)]
#[command(about = "Asynchronous request/response transport over unix sockets and HTTP")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the built-in echo task until interrupted
    Serve {
        /// Server name; the socket is <socket_dir>/<name>.sock
        #[arg(long, default_value = "echo")]
        name: String,
        /// Explicit socket path (overrides --name)
        #[arg(long)]
        socket: Option<PathBuf>,
    },
    /// Send a request and print its response
    Request {
        /// Destination URL (unix:///path or http(s)://...)
        dest: String,
        /// Task name
        task: String,
        /// Task arguments as JSON
        #[arg(long, default_value = "null")]
        args: String,
        /// Input stream URL to attach
        #[arg(long)]
        stream: Option<String>,
        /// Timeout in seconds (0 waits forever; default from config)
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Read a stream URL to stdout or a file
    Fetch {
        /// Stream URL (unix:///path)
        url: String,
        /// Write to this file instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("Failed to load configuration")?;

    match cli.command {
        Commands::Serve { name, socket } => {
            let path = socket.unwrap_or_else(|| config.server_socket(&name));
            serve(&config, path).await?;
        }
        Commands::Request {
            dest,
            task,
            args,
            stream,
            timeout,
        } => {
            let timeout = timeout.map_or_else(|| config.default_timeout(), Duration::from_secs);
            request(&config, &dest, &task, &args, stream, timeout).await?;
        }
        Commands::Fetch { url, output } => fetch(&url, output).await?,
        Commands::Config => println!("{}", serde_json::to_string_pretty(&config)?),
    }

    Ok(())
}

async fn serve(config: &Config, path: PathBuf) -> Result<()> {
    let server = TaskServer::with_dispatcher(
        path,
        acomm::Dispatcher::with_timeout(config.http_timeout()),
    );
    server.register("echo", EchoHandler);
    server
        .start()
        .with_context(|| format!("Failed to start server on {}", server.path().display()))?;
    println!("{}", server.url());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    log::info!("Shutting down...");
    server.stop().await;
    Ok(())
}

async fn request(
    config: &Config,
    dest: &str,
    task: &str,
    args: &str,
    stream: Option<String>,
    timeout: Duration,
) -> Result<()> {
    let args: serde_json::Value =
        serde_json::from_str(args).context("--args is not valid JSON")?;
    let mut req = Request::new(task, args, "");
    if let Some(url) = stream {
        req = req.with_stream_url(url);
    }

    let id = req.id().to_string();
    let tracker = Tracker::from_config(config);
    tracker
        .start()
        .with_context(|| format!("Failed to start tracker in {}", config.socket_dir.display()))?;

    let outcome = tokio::select! {
        resp = tracker.sync_request(dest, req, timeout) => resp.map_err(anyhow::Error::from),
        res = tokio::signal::ctrl_c() => match res {
            Ok(()) => Err(anyhow::anyhow!("Interrupted")),
            Err(e) => Err(anyhow::Error::from(e).context("Failed to listen for ctrl-c")),
        },
    };
    // An interrupted request is still tracked; stop would wait for it.
    if outcome.is_err() && tracker.remove_request(&id) {
        log::warn!("Abandoned request {id}");
    }
    tracker.stop().await;

    let resp = outcome.with_context(|| format!("Request '{task}' to {dest} failed"))?;
    println!("{}", serde_json::to_string_pretty(&resp)?);
    if let Some(error) = resp.error {
        anyhow::bail!("{error}");
    }
    Ok(())
}

async fn fetch(url: &str, output: Option<PathBuf>) -> Result<()> {
    let mut conn = open_stream(url)
        .await
        .with_context(|| format!("Failed to open stream {url}"))?;

    let bytes = match output {
        Some(path) => {
            let mut file = tokio::fs::File::create(&path)
                .await
                .with_context(|| format!("Failed to create {}", path.display()))?;
            let n = tokio::io::copy(&mut conn, &mut file).await?;
            file.flush().await?;
            n
        }
        None => {
            let mut stdout = tokio::io::stdout();
            let n = tokio::io::copy(&mut conn, &mut stdout).await?;
            stdout.flush().await?;
            n
        }
    };
    log::info!("Fetched {bytes} bytes from {url}");
    Ok(())
}
