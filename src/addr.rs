//! Last-seen peer addresses, each behind its own small lock. Mirrors the
//! reference implementation's unlocked global-assignment style: these are
//! independent of the engine's main mutex because updating "where did the
//! last packet from X come from" never needs to be atomic with a ring
//! mutation.

use std::net::SocketAddr;
use std::sync::Mutex;

#[derive(Default)]
pub struct AddressBook {
    pub client_1024: Mutex<Option<SocketAddr>>,
    pub client_1025: Mutex<Option<SocketAddr>>,
    pub radio_1024: Mutex<Option<SocketAddr>>,
    pub radio_1025: Mutex<Option<SocketAddr>>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }
}

pub fn set(slot: &Mutex<Option<SocketAddr>>, addr: SocketAddr) {
    *slot.lock().unwrap() = Some(addr);
}

pub fn get(slot: &Mutex<Option<SocketAddr>>) -> Option<SocketAddr> {
    *slot.lock().unwrap()
}
