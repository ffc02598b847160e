//! External hook scripts
//!
//! The daemon itself never touches addresses or routes; on link and tunnel
//! state changes it runs the configured script with the event name and a
//! fixed environment, the way an ifupdown hook would expect.

use std::path::Path;

use linkbond_config::GeneralSettings;
use linkbond_core::HookEvent;
use tracing::{debug, warn};

/// Run the hook script for one event, without blocking the driver loop
pub fn spawn(script: &Path, devname: &str, general: &GeneralSettings, event: &HookEvent) {
    let mut cmd = tokio::process::Command::new(script);
    cmd.arg(devname).arg(event.event_name());
    if let Some(tunnel) = event.tunnel() {
        cmd.arg(tunnel);
    }
    cmd.env("IP4", &general.ip4)
        .env("IP6", &general.ip6)
        .env("IP4_GATEWAY", &general.ip4_gateway)
        .env("IP6_GATEWAY", &general.ip6_gateway)
        .env("IP4_ROUTES", &general.ip4_routes)
        .env("IP6_ROUTES", &general.ip6_routes)
        .env("DEVICE", devname)
        .env("MTU", general.mtu.to_string());

    debug!(script = %script.display(), event = event.event_name(), "running hook");
    match cmd.spawn() {
        Ok(mut child) => {
            let event_name = event.event_name();
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) if !status.success() => {
                        warn!(%status, event = event_name, "hook exited with failure");
                    }
                    Err(e) => warn!(event = event_name, "hook wait failed: {e}"),
                    _ => {}
                }
            });
        }
        Err(e) => warn!(script = %script.display(), "failed to run hook: {e}"),
    }
}
