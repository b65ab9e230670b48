use anyhow::Result;
use facegated::config::Config;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: facegated [PORT]";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_thread_names(true)
        .init();

    let mut config = Config::from_env();
    let mut args = std::env::args().skip(1);
    match (args.next(), args.next()) {
        (None, _) => {}
        (Some(port), None) => match port.parse() {
            Ok(port) => config.port = port,
            Err(_) => {
                eprintln!("invalid port '{port}'\n{USAGE}");
                std::process::exit(2);
            }
        },
        (Some(_), Some(_)) => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    }

    tracing::info!(version = env!("CARGO_PKG_VERSION"), engine = ?config.engine, "facegated starting");
    facegated::serve(config).await
}
