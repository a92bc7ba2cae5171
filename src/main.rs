//! Driver CLI: loads templates from a file or directory and runs each
//! against a single target.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use arbalest::scan::ScanContext;
use arbalest::template::Template;

/// Template-driven network probing engine
#[derive(Parser, Debug)]
#[command(name = "arbalest")]
#[command(author, version, about = "Template-driven network probing engine", long_about = None)]
struct Cli {
    /// Proxy for all HTTP requests (e.g. http://127.0.0.1:8080)
    #[arg(short, long, env = "ARBALEST_PROXY")]
    proxy: Option<String>,

    /// Request timeout in seconds
    #[arg(long, default_value = "5", env = "ARBALEST_TIMEOUT")]
    timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "ARBALEST_LOG_LEVEL")]
    log_level: String,

    /// Print results as JSON lines instead of text
    #[arg(long)]
    json: bool,

    /// Template file or directory walked for .yaml/.yml files
    path: PathBuf,

    /// Target URL to probe
    target: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // rustls 0.23 needs a process-wide crypto provider before any TLS use.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    let cli = Cli::parse();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    if let Some(proxy) = &cli.proxy {
        reqwest::Proxy::all(proxy)
            .with_context(|| format!("invalid proxy address '{}'", proxy))?;
        tracing::info!("using proxy {}", proxy);
    }

    let templates = collect_templates(&cli)?;
    if templates.is_empty() {
        bail!("no templates found under {}", cli.path.display());
    }
    tracing::info!("loaded {} template(s)", templates.len());

    let mut matched_total = 0usize;
    for mut template in templates {
        if let Err(e) = template.compile() {
            tracing::warn!("skipping template {}: {}", template.id, e);
            continue;
        }

        let mut ctx = ScanContext::new(cli.target.clone(), None);
        ctx.set_timeout(std::time::Duration::from_secs(cli.timeout));
        if let Some(proxy) = &cli.proxy {
            ctx.set_proxy(proxy.clone());
        }

        let started = Instant::now();
        match template.execute_with_context(&ctx, &cli.target).await {
            Ok(results) => {
                tracing::debug!(
                    template = %template.id,
                    requests = template.total_requests,
                    elapsed = ?started.elapsed(),
                    "execution finished"
                );
                matched_total += results.len();
                for result in results {
                    if cli.json {
                        println!("{}", serde_json::to_string(&result)?);
                    } else {
                        println!("{}", result.summary());
                    }
                }
            }
            Err(e) => tracing::warn!("template {} failed: {}", template.id, e),
        }

        for warning in ctx.warnings() {
            tracing::debug!(template = %template.id, "{}", warning);
        }
    }

    tracing::info!("done, {} result(s)", matched_total);
    Ok(())
}

fn collect_templates(cli: &Cli) -> Result<Vec<Template>> {
    if cli.path.is_dir() {
        arbalest::load_templates_from_dir(&cli.path)
    } else {
        let template = Template::from_file(&cli.path)
            .with_context(|| format!("failed to load {}", cli.path.display()))?;
        Ok(vec![template])
    }
}
