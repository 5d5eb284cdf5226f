pub mod ask;
pub mod config_cmd;
pub mod doctor;
pub mod quiz;
pub mod serve;
pub mod sessions;

use mentorlink_config::AppConfig;

/// Load the configuration, with a readable error for the terminal.
pub fn load_config() -> Result<AppConfig, Box<dyn std::error::Error>> {
    Ok(AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?)
}

/// Cancels `token` on Ctrl+C.
pub fn cancel_on_ctrl_c(token: tokio_util::sync::CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::debug!("Interrupted");
            token.cancel();
        }
    });
}
