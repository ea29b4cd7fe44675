//! Downlink reader and pacer: radio -> client, and ring -> radio. Every
//! datagram from the radio is forwarded to the matching client-facing
//! socket; radio I/Q frames additionally drive the egress pacer and the
//! MOX/FIFO fault observer.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

use crate::addr::{self, AddressBook};
use crate::engine::Engine;
use crate::wire::{self, FRAME_LEN};

const FRAME_OVERHEAD: u64 = 14 + 20 + 8;

pub fn run(
    sock_hl2: UdpSocket,
    sock_client_1024: UdpSocket,
    sock_client_1025: UdpSocket,
    engine: Arc<Engine>,
    addrs: Arc<AddressBook>,
) {
    let mut buf = [0u8; FRAME_LEN];

    loop {
        let (n, peer) = match sock_hl2.recv_from(&mut buf) {
            Ok(ok) => ok,
            Err(err) => {
                log::warn!("downlink recv failed: {err}");
                continue;
            }
        };
        engine.counters.add_down_bytes(n as u64 + FRAME_OVERHEAD);
        let frame = &buf[..n];

        if peer.port() == 1025 {
            addr::set(&addrs.radio_1025, peer);
            if let Some(client) = addr::get(&addrs.client_1025) {
                forward(&sock_client_1025, frame, client);
            }
        } else {
            addr::set(&addrs.radio_1024, peer);
            if let Some(client) = addr::get(&addrs.client_1024) {
                forward(&sock_client_1024, frame, client);
            }
        }

        if wire::is_radio_iq(frame) {
            engine.observe_fault(wire::downlink_fifo_observation(frame));

            if !engine.is_pass_through() {
                for emission in engine.tick_on_radio_iq() {
                    if let Some(radio) = addr::get(&addrs.radio_1024) {
                        send(&sock_hl2, &emission.payload[..emission.len], radio);
                    }
                }
            }
        }
    }
}

fn forward(sock: &UdpSocket, buf: &[u8], dest: SocketAddr) {
    if let Err(err) = sock.send_to(buf, dest) {
        log::warn!("downlink forward to {dest} failed: {err}");
    }
}

fn send(sock: &UdpSocket, buf: &[u8], dest: SocketAddr) {
    if let Err(err) = sock.send_to(buf, dest) {
        log::warn!("paced emission to {dest} failed: {err}");
    }
}
