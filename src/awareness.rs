//! Ephemeral per-document presence ("awareness").
//!
//! Each client publishes an opaque JSON state under its 64-bit client id,
//! together with a monotonic clock. States are exchanged as length-prefixed
//! awareness updates: a varint entry count, then per entry a varint client
//! id, a varint clock, and a length-prefixed JSON string (`"null"` marks a
//! departed client). Observers see every accepted change, tagged with
//! whether it originated locally or from a remote peer; the room relies on
//! that tag to broadcast local changes without re-amplifying remote ones.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::{Error, Result};
use crate::protocol::{read_var_bytes, read_var_uint, write_var_bytes, write_var_uint};

/// Where an awareness change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Produced by this process (`set_local_state` / `clear_local_state`).
    Local,
    /// Applied from a peer's encoded update.
    Remote,
}

/// The accepted portion of one awareness update.
#[derive(Debug, Clone, Default)]
pub struct AwarenessChange {
    pub added: Vec<u64>,
    pub updated: Vec<u64>,
    pub removed: Vec<u64>,
    /// Current states of the changed clients (removed clients are absent).
    pub states: HashMap<u64, serde_json::Value>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// All client ids touched by this change, in added/updated/removed order.
    pub fn changed_clients(&self) -> Vec<u64> {
        let mut ids =
            Vec::with_capacity(self.added.len() + self.updated.len() + self.removed.len());
        ids.extend_from_slice(&self.added);
        ids.extend_from_slice(&self.updated);
        ids.extend_from_slice(&self.removed);
        ids
    }
}

/// One client's entry: a clock and the JSON state text as last seen.
/// `state == None` marks a client that announced its departure; the entry
/// is kept so later encodes still carry the removal.
#[derive(Debug, Clone)]
struct ClientEntry {
    clock: u64,
    state: Option<String>,
}

type Observer = Arc<dyn Fn(&AwarenessChange, Origin) + Send + Sync>;
type ObserverList = Arc<Mutex<Vec<(u64, Observer)>>>;

/// Presence state for one document.
pub struct Awareness {
    client_id: u64,
    entries: Mutex<HashMap<u64, ClientEntry>>,
    observers: ObserverList,
    next_observer_id: AtomicU64,
}

/// Detaches its observer when dropped.
pub struct AwarenessSubscription {
    id: u64,
    observers: Weak<Mutex<Vec<(u64, Observer)>>>,
}

impl Drop for AwarenessSubscription {
    fn drop(&mut self) {
        if let Some(observers) = self.observers.upgrade() {
            observers.lock().unwrap().retain(|(id, _)| *id != self.id);
        }
    }
}

impl Awareness {
    pub fn new(client_id: u64) -> Self {
        Self {
            client_id,
            entries: Mutex::new(HashMap::new()),
            observers: Arc::new(Mutex::new(Vec::new())),
            next_observer_id: AtomicU64::new(0),
        }
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// The local client's current state, if any.
    pub fn local_state(&self) -> Option<serde_json::Value> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(&self.client_id)
            .and_then(|e| e.state.as_deref())
            .and_then(|s| serde_json::from_str(s).ok())
    }

    /// All live client states.
    pub fn states(&self) -> HashMap<u64, serde_json::Value> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .filter_map(|(id, entry)| {
                let state = entry.state.as_deref()?;
                Some((*id, serde_json::from_str(state).ok()?))
            })
            .collect()
    }

    /// Publish the local client's state, bumping its clock.
    pub fn set_local_state(&self, state: serde_json::Value) {
        let text = state.to_string();
        let change = {
            let mut entries = self.entries.lock().unwrap();
            let entry = entries.entry(self.client_id).or_insert(ClientEntry {
                clock: 0,
                state: None,
            });
            let was_present = entry.state.is_some();
            entry.clock += 1;
            entry.state = Some(text);
            let mut change = AwarenessChange::default();
            if was_present {
                change.updated.push(self.client_id);
            } else {
                change.added.push(self.client_id);
            }
            change.states.insert(self.client_id, state);
            change
        };
        self.emit(&change, Origin::Local);
    }

    /// Announce the local client's departure.
    pub fn clear_local_state(&self) {
        let change = {
            let mut entries = self.entries.lock().unwrap();
            match entries.get_mut(&self.client_id) {
                Some(entry) if entry.state.is_some() => {
                    entry.clock += 1;
                    entry.state = None;
                    let mut change = AwarenessChange::default();
                    change.removed.push(self.client_id);
                    change
                }
                _ => return,
            }
        };
        self.emit(&change, Origin::Local);
    }

    /// Encode the given clients' entries as an awareness update.
    /// Unknown client ids are skipped.
    pub fn encode_update(&self, clients: &[u64]) -> Result<Vec<u8>> {
        let entries = self.entries.lock().unwrap();
        let selected: Vec<(u64, &ClientEntry)> = clients
            .iter()
            .filter_map(|id| entries.get(id).map(|e| (*id, e)))
            .collect();

        let mut out = Vec::new();
        write_var_uint(selected.len() as u64, &mut out);
        for (id, entry) in selected {
            write_var_uint(id, &mut out);
            write_var_uint(entry.clock, &mut out);
            let state = entry.state.as_deref().unwrap_or("null");
            write_var_bytes(state.as_bytes(), &mut out);
        }
        Ok(out)
    }

    /// Apply an encoded awareness update, returning the accepted changes.
    ///
    /// An entry wins when its clock is newer than ours, or on an equal
    /// clock when it announces a removal.
    pub fn apply_update(&self, data: &[u8], origin: Origin) -> Result<AwarenessChange> {
        let mut cursor = data;
        let count = read_var_uint(&mut cursor)?;
        // cap the pre-allocation: the count is attacker-controlled
        let mut incoming = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            let client_id = read_var_uint(&mut cursor)?;
            let clock = read_var_uint(&mut cursor)?;
            let raw = read_var_bytes(&mut cursor)?;
            let text = std::str::from_utf8(raw)
                .map_err(|_| Error::MalformedFrame("awareness state is not UTF-8"))?;
            let state: serde_json::Value = serde_json::from_str(text)
                .map_err(|_| Error::MalformedFrame("awareness state is not JSON"))?;
            incoming.push((client_id, clock, state));
        }
        if !cursor.is_empty() {
            return Err(Error::MalformedFrame("trailing bytes in awareness update"));
        }

        let change = {
            let mut entries = self.entries.lock().unwrap();
            let mut change = AwarenessChange::default();
            for (client_id, clock, state) in incoming {
                let is_removal = state.is_null();
                let accepted = match entries.get(&client_id) {
                    None => true,
                    Some(entry) => {
                        clock > entry.clock || (clock == entry.clock && is_removal)
                    }
                };
                if !accepted {
                    continue;
                }
                let previous = entries.insert(
                    client_id,
                    ClientEntry {
                        clock,
                        state: (!is_removal).then(|| state.to_string()),
                    },
                );
                let was_present = previous.as_ref().is_some_and(|e| e.state.is_some());
                match (was_present, is_removal) {
                    (true, true) => change.removed.push(client_id),
                    (false, true) => {} // removal of a client we never saw
                    (true, false) => {
                        change.updated.push(client_id);
                        change.states.insert(client_id, state);
                    }
                    (false, false) => {
                        change.added.push(client_id);
                        change.states.insert(client_id, state);
                    }
                }
            }
            change
        };

        if !change.is_empty() {
            self.emit(&change, origin);
        }
        Ok(change)
    }

    /// Register a change observer; dropping the returned subscription
    /// detaches it.
    pub fn observe<F>(&self, f: F) -> AwarenessSubscription
    where
        F: Fn(&AwarenessChange, Origin) + Send + Sync + 'static,
    {
        let id = self.next_observer_id.fetch_add(1, Ordering::Relaxed);
        self.observers.lock().unwrap().push((id, Arc::new(f)));
        AwarenessSubscription {
            id,
            observers: Arc::downgrade(&self.observers),
        }
    }

    fn emit(&self, change: &AwarenessChange, origin: Origin) {
        let observers: Vec<Observer> = {
            let guard = self.observers.lock().unwrap();
            guard.iter().map(|(_, f)| f.clone()).collect()
        };
        for observer in observers {
            observer(change, origin);
        }
    }
}
