//! Per-client state for the synthesized TCP streams.

use std::collections::HashMap;
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, RwLock};

use pkt::Endpoint;

use crate::crypt::Crypt;

/// One connected client. `seq` is the next server-to-client sequence
/// number, `ack` the next expected client-to-server one; each has a single
/// writer (the outbound and inbound worker respectively).
pub struct Client {
    pub crypt: Arc<dyn Crypt>,
    pub seq: AtomicU32,
    pub ack: AtomicU32,
}

impl Client {
    pub fn new(crypt: Arc<dyn Crypt>, seq: u32, ack: u32) -> Arc<Self> {
        Arc::new(Self {
            crypt,
            seq: AtomicU32::new(seq),
            ack: AtomicU32::new(ack),
        })
    }
}

/// Client endpoint -> session. Written on handshake, read on every data
/// packet.
#[derive(Default)]
pub struct ClientTable {
    map: RwLock<HashMap<Endpoint, Arc<Client>>>,
}

impl ClientTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a session, replacing any previous one for the endpoint. A
    /// repeated SYN therefore resets the stream counters.
    pub fn insert(&self, endpoint: Endpoint, client: Arc<Client>) {
        self.map.write().unwrap().insert(endpoint, client);
    }

    pub fn get(&self, endpoint: &Endpoint) -> Option<Arc<Client>> {
        self.map.read().unwrap().get(endpoint).cloned()
    }

    pub fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }
}
