//! Control-port relay: the client's UDP/1025 command/response channel,
//! forwarded verbatim to the radio (discovery gets redirected to the
//! link-local broadcast address, same as the I/Q-port uplink reader).

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

use crate::addr::{self, AddressBook};
use crate::wire::{self, UplinkFrame};

const DISCOVERY_ADDR: &str = "169.254.255.255:1025";
const READ_BUF: usize = 2048;

pub fn run(sock_client: UdpSocket, sock_hl2: UdpSocket, addrs: Arc<AddressBook>) {
    let mut buf = [0u8; READ_BUF];

    loop {
        let (n, peer) = match sock_client.recv_from(&mut buf) {
            Ok(ok) => ok,
            Err(err) => {
                log::warn!("control recv failed: {err}");
                continue;
            }
        };
        addr::set(&addrs.client_1025, peer);
        let frame = &buf[..n];

        let dest = if wire::classify_uplink(frame) == UplinkFrame::Discovery {
            DISCOVERY_ADDR.parse::<SocketAddr>().ok()
        } else {
            addr::get(&addrs.radio_1025)
        };

        if let Some(dest) = dest {
            if let Err(err) = sock_hl2.send_to(frame, dest) {
                log::warn!("control forward to {dest} failed: {err}");
            }
        }
    }
}
