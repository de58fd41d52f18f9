use std::path::PathBuf;

use anyhow::Context;
use mailproxy::Config;
use mailproxy::supervisor::Supervisor;

fn config_path() -> PathBuf {
    std::env::var("MAILPROXY_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./config.json"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let path = config_path();
    let config = Config::load(&path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;

    let _tracing_guard = mailproxy::init_tracing(&config);

    Supervisor::new(config).run().await
}
