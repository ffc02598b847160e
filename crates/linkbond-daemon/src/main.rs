//! Linkbond Daemon
//!
//! Bonds several UDP tunnels into one virtual point-to-point link and
//! splices TCP connections across the bond. This binary is the thin I/O
//! shell: configuration, privileges, sockets, the TUN device and signals;
//! all bonding logic lives in `linkbond-core`.

use std::ffi::CString;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser};
use tracing::{info, warn};

mod driver;
mod hooks;
mod tcp;
mod tuntap;

use linkbond_config::Settings;

#[derive(Parser)]
#[command(name = "linkbond")]
#[command(about = "Bonded multipath UDP tunnel daemon")]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(short = 'c', long = "config", default_value = "/etc/linkbond.conf")]
    config: PathBuf,

    /// Log to stdout instead of the configured pipeline
    #[arg(long)]
    debug: bool,

    /// Instance name included in log output
    #[arg(short = 'n', long = "name")]
    name: Option<String>,

    /// Do not decorate log output with the instance name
    #[arg(long = "natural-title")]
    natural_title: bool,

    /// Drop privileges to this user after opening sockets and the device
    #[arg(short = 'u', long = "user")]
    user: Option<String>,

    /// Allow running as root without dropping privileges (discouraged)
    #[arg(long = "yes-run-as-root")]
    yes_run_as_root: bool,

    /// Increase verbosity
    #[arg(short = 'v', action = ArgAction::Count)]
    verbose: u8,

    /// Decrease verbosity
    #[arg(short = 'q', action = ArgAction::Count)]
    quiet: u8,

    /// Preset a tunnel's quota budget: <tunnel>:<value>[bkm]
    #[arg(short = 'p', long = "permitted", value_name = "TUNNEL:VALUE", value_parser = parse_preset)]
    permitted: Vec<(String, u64)>,
}

/// Parse `<tunnel>:<value>[bkm]` into a tunnel name and a byte count
fn parse_preset(s: &str) -> Result<(String, u64), String> {
    let (name, rest) = s
        .split_once(':')
        .ok_or_else(|| "expected <tunnel>:<value>[bkm]".to_string())?;
    if name.is_empty() || rest.is_empty() {
        return Err("expected <tunnel>:<value>[bkm]".to_string());
    }
    let (digits, multiplier) = match rest.as_bytes()[rest.len() - 1] {
        b'b' => (&rest[..rest.len() - 1], 1u64),
        b'k' => (&rest[..rest.len() - 1], 1000),
        b'm' => (&rest[..rest.len() - 1], 1_000_000),
        b'0'..=b'9' => (rest, 1),
        other => return Err(format!("unknown magnitude suffix {:?}", other as char)),
    };
    let value: u64 = digits
        .parse()
        .map_err(|e| format!("bad value {digits:?}: {e}"))?;
    Ok((name.to_string(), value * multiplier))
}

fn init_logging(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let level = match cli.verbose as i8 - cli.quiet as i8 {
        i8::MIN..=-2 => "error",
        -1 => "warn",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    if cli.debug {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

fn drop_privileges(user: &str) -> Result<()> {
    let c_user = CString::new(user)?;
    // Safety: getpwnam returns a pointer into static libc storage; we copy
    // the two fields out before making any other libc call.
    let passwd = unsafe { libc::getpwnam(c_user.as_ptr()) };
    if passwd.is_null() {
        bail!("invalid unprivileged username {user:?}");
    }
    let (uid, gid) = unsafe { ((*passwd).pw_uid, (*passwd).pw_gid) };
    if unsafe { libc::setgid(gid) } != 0 {
        return Err(std::io::Error::last_os_error()).context("setgid failed");
    }
    if unsafe { libc::setuid(uid) } != 0 {
        return Err(std::io::Error::last_os_error()).context("setuid failed");
    }
    info!(user, "dropped privileges");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    if let Some(name) = &cli.name {
        if !cli.natural_title {
            info!(instance = %name, "starting");
        }
    }

    let running_as_root = unsafe { libc::getuid() } == 0;
    if running_as_root && cli.user.is_none() && !cli.yes_run_as_root {
        bail!(
            "you are not allowed to run this program as root; \
             specify a valid user with --user"
        );
    }

    let settings = Settings::load(&cli.config)
        .with_context(|| format!("failed to load config from {:?}", cli.config))?;

    let max_mtu = 1500 - linkbond_protocol::HEADER_SIZE - linkbond_protocol::IP4_UDP_OVERHEAD;
    if settings.general.mtu as usize > max_mtu {
        bail!(
            "mtu {} exceeds the encapsulation limit of {max_mtu}",
            settings.general.mtu
        );
    }

    // single-threaded by design: the engine is one state machine and every
    // task besides the I/O readers is the driver loop itself
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    runtime.block_on(async move {
        let mut driver = driver::Driver::new(settings, cli.config.clone()).await?;

        // sockets and the TUN device exist; root is no longer needed
        if let Some(user) = &cli.user {
            drop_privileges(user)?;
        } else if running_as_root {
            warn!("running as root");
        }

        for (tunnel, bytes) in &cli.permitted {
            if !driver.preset_quota(tunnel, *bytes) {
                eprintln!("no metered tunnel named {tunnel:?} for -p");
                std::process::exit(2);
            }
        }

        driver.run().await
    })?;

    info!("clean shutdown");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_preset_magnitudes() {
        assert_eq!(parse_preset("adsl:100").unwrap(), ("adsl".into(), 100));
        assert_eq!(parse_preset("adsl:100b").unwrap(), ("adsl".into(), 100));
        assert_eq!(parse_preset("adsl:5k").unwrap(), ("adsl".into(), 5000));
        assert_eq!(parse_preset("lte:2m").unwrap(), ("lte".into(), 2_000_000));
    }

    #[test]
    fn test_parse_preset_rejects_garbage() {
        assert!(parse_preset("noseparator").is_err());
        assert!(parse_preset("t:").is_err());
        assert!(parse_preset("t:12x").is_err());
        assert!(parse_preset(":5k").is_err());
    }
}
