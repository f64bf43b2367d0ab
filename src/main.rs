mod logger;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use smtp_blast::{Config, Dispatcher, Error, MailComposer, Plan, SmtpTransport};
use tracing_subscriber::EnvFilter;

use logger::ConsoleReporter;

/// Sends a batch of copies of one message over SMTP from a fixed pool of
/// worker threads.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// TOML file with the `smtp.*` and `mail.*` settings
    #[arg(default_value = "mail.toml")]
    config: PathBuf,
}

fn prompt_password(username: &str) -> smtp_blast::Result<String> {
    eprintln!("Enter password for {}:", username);
    rpassword::read_password().map_err(|e| Error::Config(format!("can't read password: {}", e)))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config, prompt_password)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    let config = Arc::new(config);

    let dispatcher = Dispatcher::new(
        Plan::from(config.as_ref()),
        SmtpTransport::new(Arc::clone(&config)),
        MailComposer::new(Arc::clone(&config)),
        Arc::new(ConsoleReporter),
    );
    let summary = dispatcher.start()?.wait();

    println!(
        "{} attempted, {} sent, {} failed",
        summary.attempted, summary.succeeded, summary.failed
    );
    for (worker, sent) in summary.per_worker.iter() {
        tracing::info!(worker = %worker, sent, "worker total");
    }
    Ok(())
}
