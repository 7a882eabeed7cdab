use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use warden_config::ConfigLoader;
use warden_core::{Event, Result};
use warden_runtime::{PipelineScheduler, serve};

use super::open_warden;

pub(super) async fn cmd_serve(config_loader: ConfigLoader, check_interval: u64, no_schedules: bool) -> Result<()> {
    let config = config_loader.get();
    let warden = Arc::new(open_warden(&config)?);
    let invalidator = warden.spawn_cache_invalidator();
    let shutdown = CancellationToken::new();

    // Kept alive for the duration of the loop.
    let reloader = Arc::clone(&warden);
    let _watcher = match config_loader.watch(move |updated| reloader.apply_reloaded(updated)) {
        Ok(w) => Some(w),
        Err(e) => {
            warn!(error = %e, "config hot-reload disabled");
            None
        }
    };

    let scheduled = if no_schedules || config.pipeline.schedules.is_empty() {
        None
    } else {
        let (scheduler, rx) = PipelineScheduler::new(Duration::from_secs(check_interval.max(1)));
        let loaded = scheduler.load_from_config(&config.pipeline).await;
        info!(loaded, "pipeline schedules active");
        tokio::spawn(scheduler.run(shutdown.clone()));
        Some(rx)
    };

    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            on_signal.cancel();
        }
    });

    let input = tokio::io::BufReader::new(tokio::io::stdin());
    let summary = serve(
        Arc::clone(&warden),
        input,
        tokio::io::stdout(),
        scheduled,
        shutdown.clone(),
    )
    .await?;

    shutdown.cancel();
    warden.events().publish(Event::Shutdown);
    if let Err(e) = invalidator.await {
        warn!(error = %e, "cache invalidator ended abnormally");
    }
    eprintln!(
        "{} triggers: {} ok, {} failed",
        summary.received, summary.succeeded, summary.failed
    );
    Ok(())
}
