//! The NAT table and the ephemeral port / ICMP id allocator.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use pkt::{Endpoint, TransProto};

use crate::capture::Connection;
use crate::error::PipelineError;

/// A slot whose last use is older than this is free for reuse; no explicit
/// release exists.
pub const KEEPALIVE: Duration = Duration::from_secs(30);

pub const PORT_BASE: u16 = 49152;
pub const PORT_SLOTS: usize = 16384;
pub const ICMP_ID_SLOTS: usize = 65536;

/// Last-use timestamps over a contiguous value range, scanned round-robin.
pub struct Pool {
    base: u16,
    slots: Vec<Option<Instant>>,
    cursor: usize,
}

impl Pool {
    /// Ephemeral TCP or UDP ports, 49152..=65535.
    pub fn ports() -> Self {
        Self::new(PORT_BASE, PORT_SLOTS)
    }

    /// The full 16-bit ICMP identifier space.
    pub fn icmp_ids() -> Self {
        Self::new(0, ICMP_ID_SLOTS)
    }

    fn new(base: u16, len: usize) -> Self {
        Self {
            base,
            slots: vec![None; len],
            cursor: 0,
        }
    }

    /// Claim the next stale slot, starting at the cursor so recently freed
    /// values are not reused immediately. Fails when every slot has been
    /// touched within the keep-alive window.
    pub fn allocate(&mut self, now: Instant) -> Option<u16> {
        for _ in 0..self.slots.len() {
            let s = self.cursor % self.slots.len();
            self.cursor = self.cursor.wrapping_add(1);
            if is_stale(self.slots[s], now) {
                self.slots[s] = Some(now);
                return Some(self.base + s as u16);
            }
        }
        None
    }

    /// Refresh the keep-alive stamp for a mapped value.
    pub fn touch(&mut self, value: u16, now: Instant) {
        if let Some(slot) = self.slots.get_mut(usize::from(value.wrapping_sub(self.base))) {
            *slot = Some(now);
        }
    }

    #[cfg(test)]
    fn stamp(&self, value: u16) -> Option<Instant> {
        self.slots[usize::from(value - self.base)]
    }
}

fn is_stale(slot: Option<Instant>, now: Instant) -> bool {
    match slot {
        None => true,
        Some(t) => now.checked_duration_since(t).map_or(false, |d| d > KEEPALIVE),
    }
}

/// Allocation key: the flow as the client sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quintuple {
    /// The inner packet's source endpoint.
    pub src: Endpoint,
    /// The client's outer endpoint.
    pub client: Endpoint,
    pub proto: TransProto,
}

/// What the outbound pipeline needs to undo a translation.
#[derive(Clone)]
pub struct Mapping {
    /// The client's outer endpoint.
    pub src: Endpoint,
    /// The server endpoint the client reached (listen address, port P).
    pub dst: Endpoint,
    /// The inner source endpoint from the client's view.
    pub emb_src: Endpoint,
    /// The listener connection the client arrived on.
    pub conn: Connection,
}

/// Two-way flow translation state shared by both pipelines.
pub struct Nat {
    map: RwLock<HashMap<(Endpoint, TransProto), Mapping>>,
    values: RwLock<HashMap<Quintuple, u16>>,
    tcp: Mutex<Pool>,
    udp: Mutex<Pool>,
    icmp: Mutex<Pool>,
}

impl Nat {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            values: RwLock::new(HashMap::new()),
            tcp: Mutex::new(Pool::ports()),
            udp: Mutex::new(Pool::ports()),
            icmp: Mutex::new(Pool::icmp_ids()),
        }
    }

    fn pool(&self, proto: TransProto) -> &Mutex<Pool> {
        match proto {
            TransProto::Tcp => &self.tcp,
            TransProto::Udp => &self.udp,
            TransProto::Icmpv4 => &self.icmp,
        }
    }

    /// The external value for a flow: the one already allocated for this
    /// quintuple if there is one, a fresh one otherwise.
    pub fn external_for(&self, q: &Quintuple, now: Instant) -> Result<u16, PipelineError> {
        if let Some(value) = self.values.read().unwrap().get(q) {
            return Ok(*value);
        }
        let value = self
            .pool(q.proto)
            .lock()
            .unwrap()
            .allocate(now)
            .ok_or(PipelineError::PoolEmpty(q.proto))?;
        self.values.write().unwrap().insert(*q, value);
        Ok(value)
    }

    /// Lookup without allocation; ICMPv4 errors only ride existing flows.
    pub fn lookup_value(&self, q: &Quintuple) -> Option<u16> {
        self.values.read().unwrap().get(q).copied()
    }

    pub fn insert(&self, key: (Endpoint, TransProto), mapping: Mapping) {
        self.map.write().unwrap().insert(key, mapping);
    }

    pub fn get(&self, key: &(Endpoint, TransProto)) -> Option<Mapping> {
        self.map.read().unwrap().get(key).cloned()
    }

    pub fn touch(&self, proto: TransProto, value: u16, now: Instant) {
        self.pool(proto).lock().unwrap().touch(value, now);
    }
}

impl Default for Nat {
    fn default() -> Self {
        Self::new()
    }
}
