use anyhow::Context as _;
use tracing_subscriber::EnvFilter;

/// Default directive for a `-v` count, used when `RUST_LOG` is unset.
fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info,hyper_util=warn,reqwest=warn",
        1 => "debug,hyper_util=info,reqwest=info",
        _ => "trace",
    }
}

/// Logs go to stderr; stdout carries command output.
pub fn init(verbosity: u8) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive(verbosity)))
        .context("build log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!("initialize tracing subscriber: {err}"))?;

    Ok(())
}
