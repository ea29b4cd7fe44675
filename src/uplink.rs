//! Uplink reader: client -> ring. Reads client I/Q and out-of-band frames
//! off UDP/1024, classifies them, and either forwards immediately or hands
//! them to the engine's jitter buffer.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Instant;

use crate::addr::{self, AddressBook};
use crate::engine::Engine;
use crate::wire::{self, UplinkFrame};

/// Added to the observed UDP payload length to approximate the on-wire
/// Ethernet/IP/UDP overhead for the byte-rate estimate, matching the
/// reference implementation's accounting.
const FRAME_OVERHEAD: u64 = 14 + 20 + 8;

const DISCOVERY_ADDR: &str = "169.254.255.255:1024";

pub fn run(sock_client: UdpSocket, sock_hl2: UdpSocket, engine: Arc<Engine>, addrs: Arc<AddressBook>) {
    let mut buf = [0u8; wire::FRAME_LEN];
    let mut last_arrival: Option<Instant> = None;

    loop {
        let (n, peer) = match sock_client.recv_from(&mut buf) {
            Ok(ok) => ok,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                engine.counters.take_window();
                last_arrival = None;
                continue;
            }
            Err(err) => {
                log::warn!("uplink recv failed: {err}");
                continue;
            }
        };

        let now = Instant::now();
        if let Some(prev) = last_arrival {
            engine.counters.record_jitter(now.duration_since(prev));
        }
        last_arrival = Some(now);
        engine.counters.add_up_bytes(n as u64 + FRAME_OVERHEAD);

        addr::set(&addrs.client_1024, peer);
        let frame = &buf[..n];

        match wire::classify_uplink(frame) {
            UplinkFrame::Discovery => {
                if let Ok(dest) = DISCOVERY_ADDR.parse::<SocketAddr>() {
                    send(&sock_hl2, frame, dest);
                }
            }
            UplinkFrame::StartStop => {
                engine.reset_for_start_stop();
                if let Some(radio) = addr::get(&addrs.radio_1024) {
                    send(&sock_hl2, frame, radio);
                }
            }
            UplinkFrame::ClientIq => {
                engine.parse_control_words(frame);
                if engine.is_pass_through() {
                    let emission = engine.pass_through_emit(frame);
                    if let Some(radio) = addr::get(&addrs.radio_1024) {
                        send(&sock_hl2, &emission.payload[..emission.len], radio);
                    }
                } else {
                    engine.accept_uplink(frame);
                }
            }
            UplinkFrame::Other => {
                if let Some(radio) = addr::get(&addrs.radio_1024) {
                    send(&sock_hl2, frame, radio);
                }
            }
        }
    }
}

fn send(sock: &UdpSocket, buf: &[u8], dest: SocketAddr) {
    if let Err(err) = sock.send_to(buf, dest) {
        log::warn!("uplink forward to {dest} failed: {err}");
    }
}
