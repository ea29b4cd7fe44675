mod addr;
mod config;
mod control;
mod discover;
mod downlink;
mod engine;
mod fault;
mod ring;
mod status;
mod uplink;
mod wire;

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, UdpSocket};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;

use addr::AddressBook;
use config::Config;
use engine::Engine;

const CLIENT_IQ_PORT: u16 = 1024;
const CLIENT_CTRL_PORT: u16 = 1025;
const STATUS_PORT: u16 = 8080;

/// Jitter buffer and UDP relay between an SDR client and a Hermes-Lite2 radio.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(default_value = "hl2-wifi-buffer.toml")]
    config: PathBuf,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = Config::load(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;

    log::info!(
        "starting with hl2_interface={}, wifi_interface={}, buffer_milliseconds={} (used={} frames)",
        config.hl2_interface,
        config.wifi_interface,
        config.buffer_milliseconds,
        config.used
    );

    let ifaces = discover::wait_for_interfaces(&config.hl2_interface, &config.wifi_interface);

    let sock_hl2 = bind_hl2_socket(ifaces.hl2_addr)?;
    let sock_client_1024 = bind_client_socket(CLIENT_IQ_PORT)?;
    sock_client_1024
        .set_read_timeout(Some(std::time::Duration::from_secs(1)))
        .context("setting uplink recv timeout")?;
    let sock_client_1025 = bind_client_socket(CLIENT_CTRL_PORT)?;

    let status_listener = TcpListener::bind(SocketAddrV4::new(ifaces.wifi_addr, STATUS_PORT))
        .context("binding status listener")?;

    let engine = Arc::new(Engine::new(config.used));
    let addrs = Arc::new(AddressBook::new());

    let uplink_hl2 = sock_hl2.try_clone().context("cloning hl2 socket for uplink")?;
    let control_hl2 = sock_hl2.try_clone().context("cloning hl2 socket for control relay")?;
    let downlink_client_1024 = sock_client_1024
        .try_clone()
        .context("cloning client 1024 socket for downlink")?;
    let control_client_1025 = sock_client_1025
        .try_clone()
        .context("cloning client 1025 socket for control relay")?;

    let uplink_engine = engine.clone();
    let uplink_addrs = addrs.clone();
    let uplink_thread = thread::spawn(move || {
        uplink::run(sock_client_1024, uplink_hl2, uplink_engine, uplink_addrs);
    });

    let downlink_engine = engine.clone();
    let downlink_addrs = addrs.clone();
    let downlink_thread = thread::spawn(move || {
        downlink::run(sock_hl2, downlink_client_1024, sock_client_1025, downlink_engine, downlink_addrs);
    });

    let control_addrs = addrs.clone();
    let control_thread = thread::spawn(move || {
        control::run(control_client_1025, control_hl2, control_addrs);
    });

    let status_engine = engine.clone();
    let hl2_iface = config.hl2_interface.clone();
    let wifi_iface = config.wifi_interface.clone();
    let status_thread = thread::spawn(move || {
        status::run(status_listener, status_engine, hl2_iface, wifi_iface, ifaces.hl2_addr, ifaces.wifi_addr);
    });

    for handle in [uplink_thread, downlink_thread, control_thread, status_thread] {
        let _ = handle.join();
    }

    Ok(())
}

fn bind_hl2_socket(hl2_addr: Ipv4Addr) -> Result<UdpSocket> {
    let sock = UdpSocket::bind(SocketAddrV4::new(hl2_addr, 0)).context("binding HL2-facing socket")?;
    sock.set_broadcast(true).context("enabling broadcast on HL2-facing socket")?;
    Ok(sock)
}

fn bind_client_socket(port: u16) -> Result<UdpSocket> {
    let addr: SocketAddr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into();
    let sock = UdpSocket::bind(addr).with_context(|| format!("binding client-facing socket on port {port}"))?;
    sock.set_broadcast(true)
        .with_context(|| format!("enabling broadcast on client-facing socket on port {port}"))?;
    Ok(sock)
}
