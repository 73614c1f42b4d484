use kyomei_runtime::{Kyomei, exit_code};

/// Sync-only service entry point: extracts, decodes, and stores raw events
/// for every configured chain and serves the operational API. Indexers with
/// custom handlers embed `Kyomei` as a library instead.
#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "kyomei.config.json".to_string());

    let indexer = match Kyomei::from_config_file(&config_path) {
        Ok(indexer) => indexer,
        Err(e) => {
            eprintln!("kyomei: {e}");
            std::process::exit(1);
        }
    };

    let level = indexer.config().log_level.as_str();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("KYOMEI_LOG").unwrap_or_else(|_| {
                [
                    "kyomei_runtime",
                    "kyomei_sync",
                    "kyomei_process",
                    "kyomei_cron",
                    "kyomei_source",
                    "kyomei_store",
                    "kyomei_abi",
                    "kyomei_api",
                    "kyomei_common",
                ]
                .map(|target| format!("{target}={level}"))
                .join(",")
                .into()
            }),
        )
        .json()
        .init();

    tracing::info!(config = %config_path, "Kyomei starting...");

    let result = indexer.run().await;
    if let Err(e) = &result {
        tracing::error!(error = %e, "Kyomei exited with error");
    } else {
        tracing::info!("Kyomei stopped.");
    }
    std::process::exit(exit_code(&result));
}
