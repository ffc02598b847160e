//! TUN device setup

use anyhow::{Context, Result};
use tun::AsyncDevice;

/// Create the TUN device the bonded link reads and writes. Addressing and
/// routes are the hook script's job, not ours.
pub fn create(name: &str, mtu: u16) -> Result<AsyncDevice> {
    let mut config = tun::Configuration::default();
    config.name(name).mtu(mtu as i32).up();
    #[cfg(target_os = "linux")]
    config.platform(|platform| {
        platform.packet_information(false);
    });
    tun::create_as_async(&config).with_context(|| format!("creating TUN device {name:?}"))
}
