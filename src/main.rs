use env_logger::Env;

use contact_sync::config::SyncConfig;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    // Single optional flag: --config <path>. Everything else comes from
    // the config file.
    let args: Vec<String> = std::env::args().collect();
    let config_arg = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(String::as_str);

    let config_path = SyncConfig::resolve_path(config_arg);
    log::info!("starting contact-sync (config: {})", config_path.display());

    let config = match SyncConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(e.exit_code());
        }
    };

    match contact_sync::run(config).await {
        Ok(summary) => {
            log::info!(
                "sync complete: {} created, {} updated, {} skipped, {} failed \
                 ({} rows loaded, {} records)",
                summary.created,
                summary.updated,
                summary.skipped,
                summary.failed,
                summary.rows_loaded,
                summary.records_normalized,
            );
            for email in &summary.failed_emails {
                log::warn!("failed record: {}", email);
            }
            log::info!(
                "retrieval: {} bounced, {} unsubscribed{}",
                summary.bounced,
                summary.unsubscribed,
                if summary.retrieval_incomplete {
                    " (INCOMPLETE — a collection aborted mid-pagination)"
                } else {
                    ""
                }
            );
        }
        Err(e) => {
            log::error!("run aborted: {}", e);
            std::process::exit(e.exit_code());
        }
    }
}
