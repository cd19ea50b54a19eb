use water_admin_offline_lib::{logging, run, SyncConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = SyncConfig::load()?;
    // Dropping the guard flushes the file writer; hold it until exit.
    let _guard = logging::init(&config.log_dir());
    run(config).await
}
