#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use playurl_shim::config::{DEFAULT_CONFIG_PATH, load_shim_config_from};
use playurl_shim::query::to_query_string;
use playurl_shim::{Resolver, is_legacy_playurl_url};
use std::{
    io::{self, Write},
    path::PathBuf,
};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const CLI_SESSION: &str = "cli";

#[derive(Parser, Debug)]
#[command(author, version, about = "Answer legacy playurl requests from the command line.")]
struct Cli {
    #[arg(long = "config", value_name = "PATH", default_value = DEFAULT_CONFIG_PATH, help = "Path to the config file")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve a legacy playurl URL and print the legacy JSON body
    Resolve {
        #[arg(value_name = "LEGACY_URL")]
        url: String,
        #[arg(
            short = 'H',
            long = "header",
            value_name = "NAME: VALUE",
            help = "Request header forwarded as if the legacy client sent it"
        )]
        headers: Vec<String>,
    },
    /// Sign key=value pairs and print the signed query string
    Sign {
        #[arg(value_name = "KEY=VALUE", required = true)]
        params: Vec<String>,
    },
    /// Print the recorded replacement for a legacy cid
    Override {
        #[arg(value_name = "CID")]
        cid: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "playurl_shim=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();
    let config = load_shim_config_from(&cli.config)?;
    let resolver = Resolver::from_config(&config);

    match cli.command {
        Command::Resolve { url, headers } => resolve(&resolver, &url, &headers),
        Command::Sign { params } => sign(&resolver, &params),
        Command::Override { cid } => match resolver.resolve_cid_override(&cid) {
            Some(real) => {
                println!("{real}");
                Ok(())
            }
            None => bail!("No override recorded for cid {cid}"),
        },
    }
}

fn resolve(resolver: &Resolver, url: &str, headers: &[String]) -> Result<()> {
    if !is_legacy_playurl_url(url) {
        bail!("{url} is not a legacy playurl URL");
    }
    resolver.mark_intercept(CLI_SESSION, url);
    for raw in headers {
        let (name, value) = raw
            .split_once(':')
            .ok_or_else(|| anyhow!("Header {raw:?} is not in 'Name: value' form"))?;
        resolver.on_request_header(CLI_SESSION, name.trim(), value.trim());
    }
    let body = resolver.build_response_bytes(CLI_SESSION);
    resolver.end_session(CLI_SESSION);

    let mut stdout = io::stdout().lock();
    stdout.write_all(&body).context("Writing response body")?;
    writeln!(stdout).context("Writing response body")?;
    Ok(())
}

fn sign(resolver: &Resolver, raw: &[String]) -> Result<()> {
    let params = raw
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| anyhow!("Parameter {pair:?} is not in key=value form"))
        })
        .collect::<Result<Vec<_>>>()?;
    let signed = resolver.sign(&params).context("Signing parameters")?;
    println!("{}", to_query_string(&signed));
    Ok(())
}
