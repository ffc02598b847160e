//! The event loop
//!
//! Owns the engine and every socket, forwards readiness into engine calls,
//! performs the engine's outputs, and sleeps exactly until the engine's
//! next deadline. Reader tasks never touch the engine; they funnel through
//! one channel into this loop, which is the only place state mutates.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket, lookup_host};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use linkbond_config::{Settings, TunnelSettings};
use linkbond_core::{Engine, EngineConfig, Output, TunnelCfg};

use crate::{hooks, tcp, tuntap};

/// Everything the reader tasks can tell the driver
pub enum Event {
    /// Datagram received on a tunnel socket
    Udp {
        tunnel: usize,
        from: SocketAddr,
        datagram: Bytes,
    },
    /// IP packet read from the TUN device
    Tun(Bytes),
    /// Local connection accepted for splicing
    TcpAccepted {
        socket: TcpStream,
        destination: SocketAddr,
    },
    /// Dial requested by the peer completed
    TcpConnected { flow: u32, socket: TcpStream },
    /// Dial requested by the peer failed
    TcpConnectFailed { flow: u32 },
    /// Bytes read from a flow's socket
    TcpRead { flow: u32, data: Bytes },
    /// A flow's socket reached EOF or failed reading
    TcpReadClosed { flow: u32 },
    /// The last chunk was fully written to a flow's socket
    TcpWriteDone { flow: u32 },
    /// Writing to a flow's socket failed
    TcpWriteError { flow: u32 },
}

pub struct Driver {
    engine: Engine,
    settings: Settings,
    config_path: PathBuf,
    devname: String,

    sockets: Vec<Option<Arc<UdpSocket>>>,
    socket_tasks: Vec<Option<JoinHandle<()>>>,
    tun_writer: WriteHalf<tun::AsyncDevice>,
    tun_pause: watch::Sender<bool>,
    flows: HashMap<u32, tcp::FlowHandle>,

    events_rx: mpsc::Receiver<Event>,
    events_tx: mpsc::Sender<Event>,
}

impl Driver {
    /// Bind every socket, open the TUN device, register the tunnels and
    /// spawn the reader tasks. Must run with enough privilege for the
    /// device and any low ports; the caller drops privileges afterwards.
    pub async fn new(settings: Settings, config_path: PathBuf) -> Result<Self> {
        let now = Instant::now();
        let server = settings.tunnels.iter().any(|t| t.server_mode);
        let engine_cfg = EngineConfig {
            password: settings.general.password.clone(),
            mtu: settings.general.mtu as usize,
            server,
            static_tunnel: settings.general.static_tunnel,
            resend_udp_payloads: settings.general.resend_udp_payloads,
        };
        let mut engine = Engine::new(engine_cfg, now);

        let (events_tx, events_rx) = mpsc::channel(1024);

        let devname = settings.general.tuntap_name.clone();
        let device = tuntap::create(&devname, settings.general.mtu)?;
        info!(device = %devname, "created interface");
        let (tun_reader, tun_writer) = tokio::io::split(device);
        let (tun_pause, tun_pause_rx) = watch::channel(false);
        tokio::spawn(tun_read_task(
            tun_reader,
            settings.general.mtu as usize,
            events_tx.clone(),
            tun_pause_rx,
        ));

        let mut sockets = Vec::new();
        let mut socket_tasks = Vec::new();
        for tunnel in &settings.tunnels {
            let (cfg, socket) = open_tunnel(&settings, tunnel).await?;
            let socket = Arc::new(socket);
            let idx = engine.add_tunnel(cfg, now);
            socket_tasks.push(Some(tokio::spawn(udp_read_task(
                idx,
                socket.clone(),
                events_tx.clone(),
            ))));
            sockets.push(Some(socket));
        }

        if let Some(port) = settings.general.tcp_listen_port {
            let listener = TcpListener::bind(("0.0.0.0", port))
                .await
                .with_context(|| format!("binding TCP splice listener on port {port}"))?;
            info!(port, "TCP splice listener up");
            tokio::spawn(tcp::accept_task(listener, events_tx.clone()));
        }

        Ok(Self {
            engine,
            settings,
            config_path,
            devname,
            sockets,
            socket_tasks,
            tun_writer,
            tun_pause,
            flows: HashMap::new(),
            events_rx,
            events_tx,
        })
    }

    /// Preset a metered tunnel's budget from the CLI
    pub fn preset_quota(&mut self, tunnel: &str, bytes: u64) -> bool {
        self.engine.preset_quota(tunnel, bytes)
    }

    /// Run until a termination signal arrives
    pub async fn run(mut self) -> Result<()> {
        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigusr1 = signal(SignalKind::user_defined1())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigquit = signal(SignalKind::quit())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        loop {
            self.flush_outputs().await?;
            let deadline = tokio::time::Instant::from_std(self.engine.poll_timeout());
            tokio::select! {
                biased;
                _ = sigint.recv() => { self.shutdown().await; break; }
                _ = sigquit.recv() => { self.shutdown().await; break; }
                _ = sigterm.recv() => { self.shutdown().await; break; }
                _ = sighup.recv() => {
                    if let Err(e) = self.reload().await {
                        warn!("config reload failed: {e:#}");
                    }
                }
                _ = sigusr1.recv() => self.engine.reset_quotas(),
                event = self.events_rx.recv() => {
                    let Some(event) = event else { break };
                    self.on_event(event)?;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.engine.handle_timeout(Instant::now());
                }
            }
        }
        Ok(())
    }

    fn on_event(&mut self, event: Event) -> Result<()> {
        let now = Instant::now();
        match event {
            Event::Udp {
                tunnel,
                from,
                datagram,
            } => {
                self.engine
                    .handle_udp(tunnel, from, &datagram, now)
                    .context("cannot continue against this peer")?;
            }
            Event::Tun(frame) => self.engine.on_tun_frame(&frame, now),
            Event::TcpAccepted {
                socket,
                destination,
            } => match self.engine.on_tcp_accept(destination, now) {
                Ok(flow) => {
                    let handle = tcp::register(
                        flow,
                        socket,
                        self.settings.general.mtu as usize,
                        self.events_tx.clone(),
                    );
                    self.flows.insert(flow, handle);
                }
                Err(e) => warn!("rejecting spliced connection: {e}"),
            },
            Event::TcpConnected { flow, socket } => {
                self.engine.on_tcp_connected(flow, now);
                let handle = tcp::register(
                    flow,
                    socket,
                    self.settings.general.mtu as usize,
                    self.events_tx.clone(),
                );
                self.flows.insert(flow, handle);
            }
            Event::TcpConnectFailed { flow } => self.engine.on_tcp_connect_failed(flow, now),
            Event::TcpRead { flow, data } => self.engine.on_tcp_read(flow, &data, now),
            Event::TcpReadClosed { flow } => self.engine.on_tcp_read_closed(flow, now),
            Event::TcpWriteDone { flow } => self.engine.on_tcp_write_done(flow, now),
            Event::TcpWriteError { flow } => self.engine.on_tcp_write_error(flow, now),
        }
        Ok(())
    }

    /// Perform everything the engine queued
    async fn flush_outputs(&mut self) -> Result<()> {
        while let Some(output) = self.engine.poll_output() {
            match output {
                Output::Transmit {
                    tunnel,
                    to,
                    datagram,
                } => {
                    let Some(socket) = self.sockets.get(tunnel).and_then(|s| s.clone()) else {
                        continue;
                    };
                    match socket.try_send_to(&datagram, to) {
                        Ok(_) => {}
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            // the pacer keeps this rare; the resend path
                            // covers the hole if it mattered
                            trace!(tunnel, "socket busy, datagram dropped");
                        }
                        Err(e) => {
                            warn!(tunnel, "send failed: {e}");
                            self.engine.on_send_error(tunnel, Instant::now());
                        }
                    }
                }
                Output::TunWrite(frame) => {
                    if let Err(e) = self.tun_writer.write_all(&frame).await {
                        warn!("TUN write failed: {e}");
                    }
                }
                Output::TunPause => {
                    self.tun_pause.send_replace(true);
                }
                Output::TunResume => {
                    self.tun_pause.send_replace(false);
                }
                Output::TcpConnect { flow, to } => {
                    tcp::spawn_dial(flow, to, self.events_tx.clone());
                }
                Output::TcpWrite { flow, data } => {
                    if let Some(handle) = self.flows.get(&flow) {
                        // capacity never exceeds one in-flight chunk
                        let _ = handle.write_tx.send(data).await;
                    }
                }
                Output::TcpCloseSocket { flow } => {
                    if let Some(handle) = self.flows.remove(&flow) {
                        handle.close();
                    }
                }
                Output::TcpPause { flow } => {
                    if let Some(handle) = self.flows.get(&flow) {
                        handle.pause_tx.send_replace(true);
                    }
                }
                Output::TcpResume { flow } => {
                    if let Some(handle) = self.flows.get(&flow) {
                        handle.pause_tx.send_replace(false);
                    }
                }
                Output::Hook(event) => {
                    if let Some(script) = &self.settings.general.hook_script {
                        hooks::spawn(script, &self.devname, &self.settings.general, &event);
                    } else {
                        debug!(event = event.event_name(), "no hook script configured");
                    }
                }
            }
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        info!("killed by signal, broadcasting disconnect");
        self.engine.shutdown(Instant::now());
        if let Err(e) = self.flush_outputs().await {
            warn!("final flush failed: {e:#}");
        }
    }

    /// SIGHUP: re-read the config, updating, adding and removing tunnels
    async fn reload(&mut self) -> Result<()> {
        info!("reloading configuration (SIGHUP)");
        let settings = Settings::load(&self.config_path)
            .with_context(|| format!("failed to load config from {:?}", self.config_path))?;
        let now = Instant::now();

        for idx in 0..self.engine.tunnels().len() {
            if self.engine.tunnels()[idx].retired {
                continue;
            }
            let name = self.engine.tunnels()[idx].name.clone();
            match settings.tunnels.iter().find(|t| t.name == name) {
                Some(tunnel) => {
                    let cfg = tunnel_cfg(&settings, tunnel).await?;
                    self.engine.update_tunnel(idx, &cfg);
                }
                None => {
                    self.engine.retire_tunnel(idx, now);
                    if let Some(task) = self.socket_tasks.get_mut(idx).and_then(Option::take) {
                        task.abort();
                    }
                    if let Some(slot) = self.sockets.get_mut(idx) {
                        *slot = None;
                    }
                }
            }
        }

        for tunnel in &settings.tunnels {
            if self.engine.find_tunnel(&tunnel.name).is_none() {
                let (cfg, socket) = open_tunnel(&settings, tunnel).await?;
                let socket = Arc::new(socket);
                let idx = self.engine.add_tunnel(cfg, now);
                self.socket_tasks.push(Some(tokio::spawn(udp_read_task(
                    idx,
                    socket.clone(),
                    self.events_tx.clone(),
                ))));
                self.sockets.push(Some(socket));
            }
        }

        self.settings = settings;
        Ok(())
    }
}

/// Resolve one tunnel's engine parameters from its settings
async fn tunnel_cfg(settings: &Settings, tunnel: &TunnelSettings) -> Result<TunnelCfg> {
    let peer = if tunnel.server_mode {
        None
    } else {
        let addr = tunnel.dest_addr.as_deref().expect("validated");
        let port = tunnel.dest_port.expect("validated");
        let resolved = lookup_host((addr, port))
            .await
            .with_context(|| format!("resolving {addr}:{port}"))?
            .next()
            .with_context(|| format!("no address for {addr}:{port}"))?;
        Some(resolved)
    };
    Ok(TunnelCfg {
        name: tunnel.name.clone(),
        id: tunnel.id(),
        server_mode: tunnel.server_mode,
        peer,
        bandwidth_max: tunnel.bandwidth_max,
        quota: tunnel.quota,
        fallback_only: tunnel.fallback_only,
        timeout: std::time::Duration::from_secs(settings.tunnel_timeout(tunnel) as u64),
    })
}

/// Bind one tunnel's UDP socket, honoring bind address and device
async fn open_tunnel(
    settings: &Settings,
    tunnel: &TunnelSettings,
) -> Result<(TunnelCfg, UdpSocket)> {
    let cfg = tunnel_cfg(settings, tunnel).await?;

    let bind_port = if tunnel.server_mode {
        tunnel.bind_port.expect("validated")
    } else {
        tunnel.bind_port.unwrap_or(0)
    };
    let bind_ip = match &tunnel.bind_addr {
        Some(addr) => addr
            .parse()
            .with_context(|| format!("bad bind_addr {addr:?}"))?,
        None => match cfg.peer {
            Some(SocketAddr::V6(_)) => "::".parse().unwrap(),
            _ => "0.0.0.0".parse().unwrap(),
        },
    };
    let bind: SocketAddr = SocketAddr::new(bind_ip, bind_port);

    let domain = if bind.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .context("socket creation failed")?;
    socket
        .set_reuse_address(true)
        .context("setsockopt SO_REUSEADDR failed")?;
    #[cfg(target_os = "linux")]
    if let Some(device) = &tunnel.bind_device {
        socket
            .bind_device(Some(device.as_bytes()))
            .with_context(|| format!("failed to bind on interface {device:?}"))?;
    }
    socket.set_nonblocking(true)?;
    socket
        .bind(&bind.into())
        .with_context(|| format!("{}: bind {bind} failed", tunnel.name))?;
    info!(tunnel = %tunnel.name, %bind, "bound");

    let socket = UdpSocket::from_std(socket.into())?;
    Ok((cfg, socket))
}

async fn udp_read_task(tunnel: usize, socket: Arc<UdpSocket>, events: mpsc::Sender<Event>) {
    let mut buf = vec![0u8; 4096];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                let datagram = Bytes::copy_from_slice(&buf[..len]);
                if events
                    .send(Event::Udp {
                        tunnel,
                        from,
                        datagram,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => {
                warn!(tunnel, "socket read error: {e}");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

async fn tun_read_task(
    mut reader: ReadHalf<tun::AsyncDevice>,
    mtu: usize,
    events: mpsc::Sender<Event>,
    mut pause: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; mtu + 64];
    loop {
        while *pause.borrow() {
            if pause.changed().await.is_err() {
                return;
            }
        }
        match reader.read(&mut buf).await {
            Ok(0) => {
                warn!("TUN device closed");
                return;
            }
            Ok(n) => {
                let frame = Bytes::copy_from_slice(&buf[..n]);
                if events.send(Event::Tun(frame)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!("TUN read error: {e}");
                return;
            }
        }
    }
}
