//! Ctrl-C wiring for the long-running commands.

use tracing::{info, warn};
use workerman_queue::StopSignal;

/// Stop `stop` on the first Ctrl-C. The handler runs on its own thread so the
/// loops stay synchronous.
pub fn stop_on_ctrl_c(stop: StopSignal) -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    std::thread::Builder::new()
        .name("workerman-ctrl-c".to_string())
        .spawn(move || {
            runtime.block_on(async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("Received Ctrl+C, stopping after the current job");
                        stop.stop();
                    }
                    Err(e) => warn!(error = %e, "Ctrl+C handler unavailable"),
                }
            });
        })?;

    Ok(())
}
