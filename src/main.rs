mod cli;
mod commands;
mod utils;

use anyhow::{Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;
use url::Url;

use rsdl::JobRequest;

use crate::cli::RedirectMode;
use crate::commands::RunOptions;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// URL to download
    #[arg(index = 1)]
    url: String,

    /// Output file (defaults to the file name in the URL, inside --download-dir)
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Directory to save the downloaded file
    #[arg(short = 'd', long = "download-dir", default_value = ".")]
    download_dir: PathBuf,

    /// Directory for temporary segment files (defaults to the output's directory)
    #[arg(short = 'T', long = "temp-dir")]
    temp_dir: Option<PathBuf>,

    /// Number of segments downloaded in parallel
    #[arg(short = 's', long, default_value_t = 8)]
    split: usize,

    /// User name for HTTP basic authentication
    #[arg(short = 'u', long)]
    user: Option<String>,

    /// Password for HTTP basic authentication
    #[arg(short = 'p', long)]
    password: Option<String>,

    /// HTTP proxy host
    #[arg(long = "proxy-host", requires = "proxy_port")]
    proxy_host: Option<String>,

    /// HTTP proxy port
    #[arg(long = "proxy-port", requires = "proxy_host")]
    proxy_port: Option<u16>,

    /// How often a failed segment is retried before the download fails
    #[arg(short = 'r', long, default_value_t = 0)]
    retries: u32,

    /// What to do when the server redirects [default: ask on a terminal, follow otherwise]
    #[arg(long, value_enum)]
    redirects: Option<RedirectMode>,

    /// Give up on a segment after this many seconds without data
    #[arg(long = "read-timeout")]
    read_timeout: Option<u64>,

    /// Print lifecycle events as JSON lines on stdout instead of a progress bar
    #[arg(long)]
    json: bool,

    /// Overwrite the output file if it exists
    #[arg(short = 'f', long)]
    force: bool,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = match args.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    debug!(url = %args.url, split = args.split, retries = args.retries, "CLI arguments parsed");

    let url = Url::parse(args.url.trim()).with_context(|| format!("Invalid URL: {}", args.url))?;
    let destination = crate::utils::resolve_destination(&url, &args.download_dir, args.output.as_deref())?;

    let mut request = JobRequest::new(url, destination).with_workers(args.split);
    request.temp_directory = args.temp_dir;
    request.username = args.user;
    request.password = args.password;
    request.proxy_host = args.proxy_host;
    request.proxy_port = args.proxy_port;
    request.max_segment_retries = args.retries;
    request.read_timeout = args.read_timeout.map(Duration::from_secs);

    let options = RunOptions {
        redirects: args
            .redirects
            .unwrap_or_else(|| RedirectMode::default_for(std::io::stdin().is_terminal())),
        json: args.json,
        force: args.force,
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(crate::commands::run_download(request, options))
}
