//! The transmit jitter buffer and pacing engine: the core of this relay.
//!
//! [`Engine`] owns the ring plus every control register the uplink and
//! downlink activities need to agree on (sample rate, receiver count, MOX,
//! the egress sequence counter, the fault observer) behind one
//! [`std::sync::Mutex`]. Counters are atomics so the status reporter never
//! contends with the dataplane for the lock. Network I/O never happens while
//! the lock is held. Every method here returns plain data ([`Emission`]s)
//! for the caller to send once the guard has been dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::fault::FaultState;
use crate::ring::{Ring, SlotTag, RING_MASK};
use crate::wire::{
    self, mox_bit, receiver_count, rqst_bit, set_mox_bit, set_sequence, speed_to_sample_rate,
    splice_control_words, uplink_c0_address, zero_iq_payload, FRAME_LEN, SUBFRAME_A_C0,
    SUBFRAME_B_C0,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Startup,
    Normal,
    Restarting,
}

/// A datagram ready to hand to a socket. Carries its own length because a
/// slot may have been stored with a shorter-than-`FRAME_LEN` payload.
pub struct Emission {
    pub payload: [u8; FRAME_LEN],
    pub len: usize,
}

struct Inner {
    ring: Ring,
    state: EngineState,
    sample_rate: u32,
    num_receivers: u8,
    mox: bool,
    hl2_sequence: u32,
    last_good: u16,
    pending_rqst: Option<u16>,
    rx_samples: u32,
    fault_state: FaultState,
}

impl Inner {
    fn new() -> Self {
        let mut ring = Ring::new();
        ring.slot_mut(0).seed_zero();
        Inner {
            ring,
            state: EngineState::Startup,
            sample_rate: 48_000,
            num_receivers: 1,
            mox: false,
            hl2_sequence: 0,
            last_good: 0,
            pending_rqst: None,
            rx_samples: 0,
            fault_state: FaultState::default(),
        }
    }

    fn reset(&mut self) {
        self.ring.reset();
        self.ring.slot_mut(0).seed_zero();
        self.state = EngineState::Startup;
        self.sample_rate = 48_000;
        self.num_receivers = 1;
        self.mox = false;
        self.hl2_sequence = 0;
        self.last_good = 0;
        self.pending_rqst = None;
        self.rx_samples = 0;
    }

    /// Rewrites bytes 4..8 of `payload` with the next value of the local
    /// sequence counter and records the emitted frame's MOX bit, per the
    /// sequence-regeneration rule every emission goes through.
    fn finish_emission(&mut self, mut payload: [u8; FRAME_LEN], len: usize) -> Emission {
        let seq = self.hl2_sequence;
        self.hl2_sequence = self.hl2_sequence.wrapping_add(1);
        set_sequence(&mut payload[..len], seq);
        self.mox = mox_bit(payload[SUBFRAME_A_C0]);
        Emission { payload, len }
    }
}

struct WindowState {
    up_bytes: AtomicU64,
    down_bytes: AtomicU64,
    jitter_micros: AtomicU64,
    start: Mutex<Instant>,
}

pub struct WindowSnapshot {
    pub up_bytes: u64,
    pub down_bytes: u64,
    pub jitter: Duration,
    pub elapsed: Duration,
}

/// Free-running dataplane counters, read by the status reporter without
/// taking the engine's main lock.
pub struct Counters {
    pub seq_out_of_order: AtomicU64,
    pub seq_duplicate: AtomicU64,
    pub seq_missing: AtomicU64,
    pub seq_too_late: AtomicU64,
    pub buffer_overflow: AtomicU64,
    pub buffer_underflow: AtomicU64,
    pub hl2_buffer_faults: AtomicU64,
    window: WindowState,
}

impl Counters {
    fn new() -> Self {
        Counters {
            seq_out_of_order: AtomicU64::new(0),
            seq_duplicate: AtomicU64::new(0),
            seq_missing: AtomicU64::new(0),
            seq_too_late: AtomicU64::new(0),
            buffer_overflow: AtomicU64::new(0),
            buffer_underflow: AtomicU64::new(0),
            hl2_buffer_faults: AtomicU64::new(0),
            window: WindowState {
                up_bytes: AtomicU64::new(0),
                down_bytes: AtomicU64::new(0),
                jitter_micros: AtomicU64::new(0),
                start: Mutex::new(Instant::now()),
            },
        }
    }

    pub fn add_up_bytes(&self, n: u64) {
        self.window.up_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_down_bytes(&self, n: u64) {
        self.window.down_bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// Folds `delta` into the rolling maximum inter-arrival jitter.
    pub fn record_jitter(&self, delta: Duration) {
        let micros = delta.as_micros().min(u128::from(u64::MAX)) as u64;
        self.window.jitter_micros.fetch_max(micros, Ordering::Relaxed);
    }

    /// Reads and resets the rate/jitter window. Called both by the status
    /// page (so each render reports "since it was last read") and by the
    /// uplink reader on a receive timeout.
    pub fn take_window(&self) -> WindowSnapshot {
        let up_bytes = self.window.up_bytes.swap(0, Ordering::Relaxed);
        let down_bytes = self.window.down_bytes.swap(0, Ordering::Relaxed);
        let jitter_micros = self.window.jitter_micros.swap(0, Ordering::Relaxed);
        let mut start = self.window.start.lock().unwrap();
        let elapsed = start.elapsed();
        *start = Instant::now();
        WindowSnapshot {
            up_bytes,
            down_bytes,
            jitter: Duration::from_micros(jitter_micros),
            elapsed,
        }
    }

    fn reset_all(&self) {
        self.seq_out_of_order.store(0, Ordering::Relaxed);
        self.seq_duplicate.store(0, Ordering::Relaxed);
        self.seq_missing.store(0, Ordering::Relaxed);
        self.seq_too_late.store(0, Ordering::Relaxed);
        self.buffer_overflow.store(0, Ordering::Relaxed);
        self.buffer_underflow.store(0, Ordering::Relaxed);
        self.hl2_buffer_faults.store(0, Ordering::Relaxed);
        let _ = self.take_window();
    }
}

pub struct StatusSnapshot {
    pub state: EngineState,
    pub fill: u16,
    pub used: u16,
    pub sample_rate: u32,
    pub num_receivers: u8,
    pub seq_out_of_order: u64,
    pub seq_duplicate: u64,
    pub seq_missing: u64,
    pub seq_too_late: u64,
    pub buffer_overflow: u64,
    pub buffer_underflow: u64,
    pub hl2_buffer_faults: u64,
    pub up_bytes: u64,
    pub down_bytes: u64,
    pub jitter: Duration,
    pub window_elapsed: Duration,
}

pub struct Engine {
    inner: Mutex<Inner>,
    pub counters: Counters,
    /// Target fill in frames. Zero selects pass-through mode.
    pub used: u16,
}

impl Engine {
    pub fn new(used: u16) -> Self {
        Engine {
            inner: Mutex::new(Inner::new()),
            counters: Counters::new(),
            used,
        }
    }

    pub fn is_pass_through(&self) -> bool {
        self.used == 0
    }

    /// Handles a start/stop frame: clears the ring, zeroes counters and
    /// control registers, and returns to STARTUP.
    pub fn reset_for_start_stop(&self) {
        self.inner.lock().unwrap().reset();
        self.counters.reset_all();
        log::info!("start/stop received; engine reset to STARTUP");
    }

    /// Decodes speed and receiver count from whichever sub-frame's C0
    /// address is zero, updating the control registers. Applied identically
    /// on the pass-through and buffered paths.
    pub fn parse_control_words(&self, buf: &[u8]) {
        let (c0a, c0b) = wire::c0_pair(buf);
        let (addr, speed, num_rx) = if uplink_c0_address(c0a) == 0 {
            (0u8, buf[SUBFRAME_A_C0 + 1] & 0x03, receiver_count(buf[SUBFRAME_A_C0 + 4]))
        } else {
            let addr_b = uplink_c0_address(c0b);
            if addr_b != 0 {
                return;
            }
            (0u8, buf[SUBFRAME_B_C0 + 1] & 0x03, receiver_count(buf[SUBFRAME_B_C0 + 4]))
        };
        debug_assert_eq!(addr, 0);
        let sample_rate = speed_to_sample_rate(speed);
        let mut inner = self.inner.lock().unwrap();
        inner.sample_rate = sample_rate;
        inner.num_receivers = num_rx;
    }

    /// Emits a client I/Q frame verbatim (besides the sequence rewrite) when
    /// the relay is configured for pass-through (`used == 0`).
    pub fn pass_through_emit(&self, buf: &[u8]) -> Emission {
        let mut payload = [0u8; FRAME_LEN];
        payload[..buf.len()].copy_from_slice(buf);
        self.inner.lock().unwrap().finish_emission(payload, buf.len())
    }

    /// Inserts an accepted client I/Q frame into the ring per the
    /// acceptance algorithm. Overflow is not policed here; the pacer trims
    /// it on the next tick.
    pub fn accept_uplink(&self, buf: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        let index = inner.ring.index(wire::ring_sequence(buf));

        if inner.ring.is_empty() {
            inner.ring.set_read(index);
            inner.ring.advance_write_to(index);
        } else if index == inner.ring.write {
            inner.ring.advance_write_to(index);
        } else {
            let write = inner.ring.write;
            let above = Ring::distance(index, write);
            let below = Ring::distance(write, index);
            if above < below {
                // the sequence jumped forward; accept with a skip
                inner.ring.advance_write_to(index);
            } else {
                self.counters.seq_out_of_order.fetch_add(1, Ordering::Relaxed);
                let read = inner.ring.read;
                let above_r = Ring::distance(index, read);
                let below_r = Ring::distance(read, index);
                if below_r < above_r {
                    self.counters.seq_too_late.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                // behind write but still within the active window: store in
                // place without moving either cursor
            }
        }

        let rqst = rqst_bit(buf[SUBFRAME_A_C0]) || rqst_bit(buf[SUBFRAME_B_C0]);
        let slot = inner.ring.slot_mut(index);
        if matches!(slot.tag, SlotTag::Filled | SlotTag::FilledRqst) {
            self.counters.seq_duplicate.fetch_add(1, Ordering::Relaxed);
        }
        slot.store(buf, rqst);
        if rqst {
            inner.pending_rqst = Some(index);
        }
    }

    /// Advances the sample-accounting clock on a radio-origin I/Q frame and
    /// runs the pacer's state machine, returning zero or more frames to
    /// send to the radio. Only meaningful when `used > 0`.
    pub fn tick_on_radio_iq(&self) -> Vec<Emission> {
        let mut inner = self.inner.lock().unwrap();
        let mut emissions = Vec::new();

        self.trim_overflow(&mut inner);

        let samples_per_frame = (504 / (u32::from(inner.num_receivers) * 6 + 2)) * 2;
        inner.rx_samples += samples_per_frame;
        let ratio = inner.sample_rate / 48_000;
        if inner.rx_samples / ratio >= 126 {
            inner.rx_samples -= 126 * ratio;
            self.fire_tick(&mut inner, &mut emissions);
        }

        emissions
    }

    fn trim_overflow(&self, inner: &mut Inner) {
        let threshold = (u32::from(self.used) * 6 / 5) as u16;
        if inner.ring.fill() <= threshold {
            return;
        }
        self.counters.buffer_overflow.fetch_add(1, Ordering::Relaxed);
        let new_read = inner.ring.write.wrapping_sub(self.used) & RING_MASK;
        let mut idx = inner.ring.read;
        while idx != new_read {
            inner.ring.slot_mut(idx).tag = SlotTag::Empty;
            idx = idx.wrapping_add(1) & RING_MASK;
        }
        inner.ring.set_read(new_read);
    }

    fn fire_tick(&self, inner: &mut Inner, emissions: &mut Vec<Emission>) {
        match inner.state {
            EngineState::Startup => {
                if let Some(idx) = inner.pending_rqst.take() {
                    let slot = inner.ring.slot(idx);
                    if slot.tag != SlotTag::Empty {
                        let payload = slot.payload;
                        let len = slot.len;
                        emissions.push(inner.finish_emission(payload, len));
                    }
                }
                if inner.ring.fill() >= self.used {
                    inner.state = EngineState::Normal;
                    log::info!("jitter buffer reached target fill; entering NORMAL");
                }
            }
            EngineState::Normal => {
                if inner.ring.is_empty() {
                    self.counters.buffer_underflow.fetch_add(1, Ordering::Relaxed);
                    log::info!("jitter buffer ran dry; entering RESTARTING");
                    inner.state = EngineState::Restarting;
                    return;
                }

                let read = inner.ring.read;
                // Snapshot the pending-RQST slot's payload before the
                // in-band splice below can overwrite it in place (the
                // pending slot and `read` are the same slot whenever a
                // retransmit of the current read sequence carries RQST).
                let pending_rqst_snapshot =
                    inner.pending_rqst.map(|idx| inner.ring.slot(idx).payload);

                if inner.ring.slot(read).tag == SlotTag::FilledRqst {
                    let last_good_payload = inner.ring.slot(inner.last_good).payload;
                    let slot = inner.ring.slot_mut(read);
                    splice_control_words(&mut slot.payload, &last_good_payload);
                    slot.tag = SlotTag::Filled;
                }

                let (payload, len) = if inner.ring.slot(read).tag == SlotTag::Filled {
                    let slot = inner.ring.slot(read);
                    let payload = slot.payload;
                    let len = slot.len;
                    inner.last_good = read;
                    inner.ring.slot_mut(read).tag = SlotTag::Empty;
                    (payload, len)
                } else {
                    let lg = inner.last_good;
                    if inner.ring.slot(lg).tag != SlotTag::Zeroed {
                        let slot = inner.ring.slot_mut(lg);
                        zero_iq_payload(&mut slot.payload);
                        slot.tag = SlotTag::Zeroed;
                    }
                    self.counters.seq_missing.fetch_add(1, Ordering::Relaxed);
                    let slot = inner.ring.slot(lg);
                    (slot.payload, slot.len)
                };
                inner.ring.advance_read();

                let emitted = inner.finish_emission(payload, len);
                let emitted_payload = emitted.payload;
                let emitted_len = emitted.len;
                emissions.push(emitted);

                if let (Some(_), Some(rqst_payload)) =
                    (inner.pending_rqst.take(), pending_rqst_snapshot)
                {
                    let mut extra = emitted_payload;
                    splice_control_words(&mut extra, &rqst_payload);
                    let mox = inner.mox;
                    extra[SUBFRAME_A_C0] = set_mox_bit(extra[SUBFRAME_A_C0], mox);
                    extra[SUBFRAME_B_C0] = set_mox_bit(extra[SUBFRAME_B_C0], mox);
                    emissions.push(inner.finish_emission(extra, emitted_len));
                }
            }
            EngineState::Restarting => {
                let lg = inner.last_good;
                if inner.ring.slot(lg).tag != SlotTag::Zeroed {
                    let slot = inner.ring.slot_mut(lg);
                    zero_iq_payload(&mut slot.payload);
                    slot.tag = SlotTag::Zeroed;
                }
                let slot = inner.ring.slot(lg);
                let payload = slot.payload;
                let len = slot.len;
                emissions.push(inner.finish_emission(payload, len));

                if inner.ring.fill() >= self.used {
                    inner.state = EngineState::Normal;
                    log::info!("jitter buffer recovered; returning to NORMAL");
                }
            }
        }
    }

    /// Steps the MOX/FIFO fault observer. `fifo_byte` is only meaningful
    /// (and thus only `Some`) on frames whose downlink C0 address decodes
    /// to zero; see [`crate::wire::downlink_fifo_observation`].
    pub fn observe_fault(&self, fifo_byte: Option<u8>) {
        let Some(fifo_byte) = fifo_byte else {
            return;
        };
        let mut inner = self.inner.lock().unwrap();
        let mox = inner.mox;
        let (next, newly_faulted) = inner.fault_state.step(mox, fifo_byte);
        inner.fault_state = next;
        if newly_faulted {
            self.counters.hl2_buffer_faults.fetch_add(1, Ordering::Relaxed);
            log::info!("HL2 transmit FIFO fault observed");
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let (state, fill, sample_rate, num_receivers) = {
            let inner = self.inner.lock().unwrap();
            (inner.state, inner.ring.fill(), inner.sample_rate, inner.num_receivers)
        };
        let window = self.counters.take_window();
        StatusSnapshot {
            state,
            fill,
            used: self.used,
            sample_rate,
            num_receivers,
            seq_out_of_order: self.counters.seq_out_of_order.load(Ordering::Relaxed),
            seq_duplicate: self.counters.seq_duplicate.load(Ordering::Relaxed),
            seq_missing: self.counters.seq_missing.load(Ordering::Relaxed),
            seq_too_late: self.counters.seq_too_late.load(Ordering::Relaxed),
            buffer_overflow: self.counters.buffer_overflow.load(Ordering::Relaxed),
            buffer_underflow: self.counters.buffer_underflow.load(Ordering::Relaxed),
            hl2_buffer_faults: self.counters.hl2_buffer_faults.load(Ordering::Relaxed),
            up_bytes: window.up_bytes,
            down_bytes: window.down_bytes,
            jitter: window.jitter,
            window_elapsed: window.elapsed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{set_sequence, DIR_CLIENT_IQ, DIR_RADIO_IQ, MAGIC};

    fn iq_frame(seq: u32, c0: u8) -> [u8; FRAME_LEN] {
        let mut buf = [0u8; FRAME_LEN];
        buf[0] = MAGIC[0];
        buf[1] = MAGIC[1];
        buf[3] = DIR_CLIENT_IQ;
        set_sequence(&mut buf, seq);
        buf[SUBFRAME_A_C0] = c0;
        buf[SUBFRAME_B_C0] = c0;
        buf
    }

    fn radio_iq_frame() -> [u8; FRAME_LEN] {
        let mut buf = [0u8; FRAME_LEN];
        buf[0] = MAGIC[0];
        buf[1] = MAGIC[1];
        buf[3] = DIR_RADIO_IQ;
        buf
    }

    #[test]
    fn pass_through_rewrites_sequence_only() {
        let engine = Engine::new(0);
        assert!(engine.is_pass_through());
        let frame = iq_frame(5, 0);
        let e1 = engine.pass_through_emit(&frame);
        let e2 = engine.pass_through_emit(&frame);
        assert_eq!(wire::sequence(&e1.payload), 0);
        assert_eq!(wire::sequence(&e2.payload), 1);
        assert_eq!(e1.payload[SUBFRAME_A_C0], frame[SUBFRAME_A_C0]);
    }

    #[test]
    fn reorder_emits_in_ascending_sequence() {
        let engine = Engine::new(4);
        for seq in [10u32, 12, 11, 13] {
            engine.accept_uplink(&iq_frame(seq, 0));
        }
        let mut emitted = Vec::new();
        let mut guard = 0;
        while emitted.len() < 4 && guard < 100 {
            emitted.extend(engine.tick_on_radio_iq());
            guard += 1;
        }
        assert_eq!(emitted.len(), 4);
        for (i, e) in emitted.iter().enumerate() {
            assert_eq!(wire::sequence(&e.payload), i as u32);
        }
    }

    #[test]
    fn duplicate_sequence_is_counted() {
        let engine = Engine::new(4);
        engine.accept_uplink(&iq_frame(10, 0));
        engine.accept_uplink(&iq_frame(10, 0));
        engine.accept_uplink(&iq_frame(11, 0));
        assert_eq!(engine.counters.seq_duplicate.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn start_stop_resets_control_registers() {
        let engine = Engine::new(4);
        engine.accept_uplink(&iq_frame(10, 0));
        engine.parse_control_words(&{
            let mut f = iq_frame(10, 0);
            f[SUBFRAME_A_C0 + 1] = 2; // speed -> 192000
            f
        });
        engine.reset_for_start_stop();
        let snap = engine.snapshot();
        assert_eq!(snap.fill, 0);
        assert_eq!(snap.sample_rate, 48_000);
        assert_eq!(snap.num_receivers, 1);
        assert!(matches!(snap.state, EngineState::Startup));
    }

    #[test]
    fn overflow_is_trimmed_to_used() {
        let used = 8u16;
        let engine = Engine::new(used);
        for seq in 0..(2 * used) {
            engine.accept_uplink(&iq_frame(u32::from(seq), 0));
        }
        for _ in 0..4 {
            engine.tick_on_radio_iq();
        }
        let snap = engine.snapshot();
        assert!(snap.fill <= used);
        assert!(engine.counters.buffer_overflow.load(Ordering::Relaxed) >= 1);
    }

    #[test]
    fn underflow_then_recovery_transitions_state() {
        let used = 4u16;
        let engine = Engine::new(used);
        for seq in 0..used {
            engine.accept_uplink(&iq_frame(u32::from(seq), 0));
        }
        // drive enough radio frames to reach NORMAL and then drain the ring dry
        for _ in 0..(used as usize + 2) {
            engine.tick_on_radio_iq();
        }
        let snap = engine.snapshot();
        assert!(matches!(snap.state, EngineState::Restarting));

        for seq in used..(2 * used) {
            engine.accept_uplink(&iq_frame(u32::from(seq), 0));
        }
        for _ in 0..(used as usize + 2) {
            engine.tick_on_radio_iq();
        }
        let snap = engine.snapshot();
        assert!(matches!(snap.state, EngineState::Normal));
    }

    #[test]
    fn fault_observer_counts_one_fault_per_assertion() {
        let used = 4u16;
        let engine = Engine::new(used);
        for seq in 0..used {
            engine.accept_uplink(&iq_frame(u32::from(seq), 0x01)); // mox=1
        }
        // drive enough ticks to reach NORMAL and emit at least one frame,
        // which latches engine.mox from the emitted slot's C0 bit
        let mut emitted = 0;
        let mut guard = 0;
        while emitted == 0 && guard < 100 {
            emitted += engine.tick_on_radio_iq().len();
            guard += 1;
        }
        assert!(emitted > 0);

        engine.observe_fault(Some(0x00)); // IDLE -> ARMED
        engine.observe_fault(Some(0x05)); // ARMED -> ENGAGED (samples present)
        engine.observe_fault(Some(0x80)); // ENGAGED -> FAULTED
        engine.observe_fault(Some(0x80)); // stays FAULTED, no new fault
        assert_eq!(engine.counters.hl2_buffer_faults.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn radio_iq_classification_used_by_caller() {
        let frame = radio_iq_frame();
        assert!(wire::is_radio_iq(&frame));
    }
}
