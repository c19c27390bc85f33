use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use tracing::Level;
use trellis::agent::PROVIDER;
use trellis::backup::ShootStateBackup;
use trellis::clock::RealClock;
use trellis::config::{Config, ENV_STATE_KEY_FILE};
use trellis::crypto::StateKey;
use trellis::server::TrellisServer;
use trellis::store::kubernetes::KubeStore;
use trellis::Error;

const USAGE: &str = "usage: trellis [serve | backup <entry> | fetch <entry>]";

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        tracing::error!(%err, "trellis failed");
        eprintln!("{err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Error> {
    let config = Config::load()?;
    let level = Level::from_str(&config.log_level)
        .map_err(|e| Error::Config(format!("invalid log level {:?}: {e}", config.log_level)))?;
    tracing_subscriber::fmt().compact().with_max_level(level).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        [] | ["serve"] => TrellisServer::new(config).await?.serve().await,
        ["backup", entry] => {
            let snapshot = shoot_state_backup(&config, entry).await?.backup().await?;
            tracing::info!(
                extensions = snapshot.extensions.0.len(),
                gardener = snapshot.gardener.0.len(),
                "backup complete"
            );
            Ok(())
        }
        ["fetch", entry] => {
            let snapshot = shoot_state_backup(&config, entry).await?.fetch().await?;
            println!("{}", String::from_utf8_lossy(&snapshot.to_json()?));
            Ok(())
        }
        _ => Err(Error::Config(USAGE.to_string())),
    }
}

async fn shoot_state_backup(config: &Config, entry: &str) -> Result<ShootStateBackup, Error> {
    let key_file = std::env::var_os(ENV_STATE_KEY_FILE)
        .map(PathBuf::from)
        .ok_or_else(|| Error::Config(format!("{ENV_STATE_KEY_FILE} must be set")))?;
    let key = StateKey::from_file(&key_file)?;
    let store = KubeStore::try_default()
        .await
        .map_err(|e| Error::Config(format!("failed to create kubernetes client: {e}")))?;

    Ok(ShootStateBackup::new(
        Arc::new(store),
        Arc::new(RealClock),
        config.namespace.clone(),
        PROVIDER,
        entry,
        key,
        config.wait.options(),
    ))
}
