//! Item store.
//!
//! The store owns every item defined at startup and provides thread-safe
//! reads, writes, flag updates and change notification.
//!
//! # Locking
//!
//! Each item is guarded by its own lock; there is no store-wide lock because
//! the set of items is fixed once the store is built. A write takes the item
//! lock, applies the change and captures the resulting report, then releases
//! the lock **before** invoking subscriber callbacks. Callbacks therefore run
//! in the writer's thread, in registration order, and are free to write back
//! into the store (the same key or any other) without deadlocking.
//!
//! The subscriber list has a separate lock that is only held long enough to
//! snapshot the handlers to call.
//!
//! # Notification order
//!
//! Every change takes a sequence number while the item lock is held.
//! Dispatch for one item goes through a gate that one thread holds at a
//! time; the holding thread may re-enter it, so a callback can still write
//! to the item it is being notified about. A notification that has been
//! overtaken by a newer one for the same address is dropped, so subscribers
//! always end on the value the store holds. A slow callback delays further
//! notifications of that item, not writes to it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::StoreError;
use crate::model::{
    split_address, DataType, FlagKind, Flags, ItemDefinition, ItemReport, Reading, Value,
};

/// Receives change notifications for a subscribed address.
///
/// Implementations carry whatever per-subscription state they need; the
/// store only passes the address that changed and its new reading.
pub trait UpdateHandler: Send + Sync {
    fn on_update(&self, address: &str, reading: &Reading);
}

impl<F> UpdateHandler for F
where
    F: Fn(&str, &Reading) + Send + Sync,
{
    fn on_update(&self, address: &str, reading: &Reading) {
        self(address, reading)
    }
}

/// Shared handle to a subscription callback. Identity is pointer identity.
pub type Handler = Arc<dyn UpdateHandler>;

fn same_handler(a: &Handler, b: &Handler) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Subscriber {
    owner: String,
    /// `None` for the item value, `Some(name)` for an aux slot.
    aux: Option<String>,
    handler: Handler,
}

struct ItemState {
    value: Value,
    flags: Flags,
    updated: Instant,
    aux: Vec<(String, Option<Value>)>,
    /// Bumped on every change that is notified.
    seq: u64,
}

#[derive(Default)]
struct GateState {
    owner: Option<ThreadId>,
    depth: usize,
    /// Latest sequence number dispatched per address (`None` = the value).
    delivered: HashMap<Option<String>, u64>,
}

/// Serializes notification of one item across threads. Re-entrant for the
/// thread holding it.
#[derive(Default)]
struct DispatchGate {
    state: Mutex<GateState>,
    idle: Condvar,
}

impl DispatchGate {
    fn enter(&self) -> GateGuard<'_> {
        let me = thread::current().id();
        let mut state = lock(&self.state);
        loop {
            let owner = state.owner;
            match owner {
                None => {
                    state.owner = Some(me);
                    state.depth = 1;
                    break;
                }
                Some(owner) if owner == me => {
                    state.depth += 1;
                    break;
                }
                Some(_) => {
                    state = self
                        .idle
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
        GateGuard { gate: self }
    }
}

struct GateGuard<'a> {
    gate: &'a DispatchGate,
}

impl GateGuard<'_> {
    /// Record `seq` as dispatched for `aux` unless something newer already
    /// was. Returns false when the notification is stale.
    fn claim(&self, aux: Option<&str>, seq: u64) -> bool {
        let mut state = lock(&self.gate.state);
        let latest = state.delivered.entry(aux.map(String::from)).or_insert(0);
        if *latest > seq {
            return false;
        }
        *latest = seq;
        true
    }

    fn superseded(&self, aux: Option<&str>, seq: u64) -> bool {
        let state = lock(&self.gate.state);
        let key = aux.map(String::from);
        state.delivered.get(&key).is_some_and(|latest| *latest > seq)
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        let mut state = lock(&self.gate.state);
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.gate.idle.notify_one();
        }
    }
}

impl ItemState {
    fn report(&self) -> ItemReport {
        ItemReport {
            value: self.value.clone(),
            flags: self.flags,
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

/// A single named value and its subscribers.
pub struct Item {
    def: ItemDefinition,
    state: Mutex<ItemState>,
    subscribers: Mutex<Vec<Subscriber>>,
    gate: DispatchGate,
}

impl Item {
    fn new(def: ItemDefinition) -> Result<Self, StoreError> {
        let value = match &def.initial {
            Some(initial) => def
                .data_type
                .convert(initial)
                .ok_or_else(|| StoreError::BadValue {
                    key: def.key.clone(),
                    value: initial.to_string(),
                    data_type: def.data_type,
                })?,
            None => def.data_type.zero(),
        };
        let value = clamp(&def, value);
        let aux = def.aux.iter().map(|name| (name.clone(), None)).collect();

        Ok(Self {
            state: Mutex::new(ItemState {
                value,
                flags: Flags::default(),
                updated: Instant::now(),
                aux,
                seq: 0,
            }),
            subscribers: Mutex::new(Vec::new()),
            gate: DispatchGate::default(),
            def,
        })
    }

    pub fn key(&self) -> &str {
        &self.def.key
    }

    pub fn data_type(&self) -> DataType {
        self.def.data_type
    }

    pub fn description(&self) -> &str {
        &self.def.description
    }

    pub fn min(&self) -> Option<f64> {
        self.def.min
    }

    pub fn max(&self) -> Option<f64> {
        self.def.max
    }

    pub fn units(&self) -> &str {
        &self.def.units
    }

    /// Time-to-live in milliseconds; 0 means the item never goes stale.
    pub fn tol(&self) -> u64 {
        self.def.tol
    }

    pub fn aux_names(&self) -> impl Iterator<Item = &str> {
        self.def.aux.iter().map(String::as_str)
    }

    pub fn definition(&self) -> &ItemDefinition {
        &self.def
    }

    /// Snapshot of the current value and flags.
    pub fn report(&self) -> ItemReport {
        lock(&self.state).report()
    }

    pub fn aux_value(&self, name: &str) -> Result<Option<Value>, StoreError> {
        lock(&self.state)
            .aux
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| StoreError::KeyNotFound(format!("{}.{}", self.def.key, name)))
    }

    /// Time since the value was last written.
    pub fn age(&self) -> Duration {
        lock(&self.state).updated.elapsed()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    fn has_aux(&self, name: &str) -> bool {
        self.def.aux.iter().any(|n| n == name)
    }

    /// Convert and clamp a raw value; a failure is logged and reported.
    fn normalize(&self, raw: &Value) -> Result<Value, StoreError> {
        match self.def.data_type.convert(raw) {
            Some(value) => Ok(clamp(&self.def, value)),
            None => {
                warn!(
                    key = %self.def.key,
                    value = %raw,
                    "Dropping write: value cannot be converted to {}",
                    self.def.data_type
                );
                Err(StoreError::BadValue {
                    key: self.def.key.clone(),
                    value: raw.to_string(),
                    data_type: self.def.data_type,
                })
            }
        }
    }

    /// Apply a write. The sequence number is `Some` when anything changed.
    fn write_value(
        &self,
        raw: &Value,
        flags: Option<Flags>,
    ) -> Result<(ItemReport, Option<u64>), StoreError> {
        let value = self.normalize(raw)?;

        let mut state = lock(&self.state);
        let mut changed = state.value != value;
        state.value = value;
        state.updated = Instant::now();
        // A fresh value is never old.
        changed |= state.flags.set(FlagKind::Old, false);
        if let Some(flags) = flags {
            for kind in [
                FlagKind::Annunciate,
                FlagKind::Bad,
                FlagKind::Fail,
                FlagKind::SecFail,
            ] {
                changed |= state.flags.set(kind, flags.get(kind));
            }
        }
        let seq = changed.then(|| state.next_seq());
        Ok((state.report(), seq))
    }

    fn write_aux(&self, name: &str, raw: &Value) -> Result<(Option<Value>, Option<u64>), StoreError> {
        let value = self.def.data_type.convert(raw).ok_or_else(|| {
            warn!(key = %self.def.key, aux = name, value = %raw, "Dropping aux write: bad value");
            StoreError::BadValue {
                key: format!("{}.{}", self.def.key, name),
                value: raw.to_string(),
                data_type: self.def.data_type,
            }
        })?;

        let mut state = lock(&self.state);
        let slot = state
            .aux
            .iter_mut()
            .find(|(n, _)| n == name)
            .ok_or_else(|| StoreError::KeyNotFound(format!("{}.{}", self.def.key, name)))?;
        let changed = slot.1.as_ref() != Some(&value);
        slot.1 = Some(value.clone());
        let seq = changed.then(|| state.next_seq());
        Ok((Some(value), seq))
    }

    fn set_flag(&self, kind: FlagKind, on: bool) -> (ItemReport, Option<u64>) {
        let mut state = lock(&self.state);
        let seq = state.flags.set(kind, on).then(|| state.next_seq());
        (state.report(), seq)
    }

    /// Raise `old` if the item has outlived its time-to-live at `now`.
    fn mark_stale_at(&self, now: Instant) -> Option<(ItemReport, u64)> {
        if self.def.tol == 0 {
            return None;
        }
        let mut state = lock(&self.state);
        let age = now.saturating_duration_since(state.updated);
        if !state.flags.old && age > Duration::from_millis(self.def.tol) {
            state.flags.old = true;
            let seq = state.next_seq();
            Some((state.report(), seq))
        } else {
            None
        }
    }

    /// Invoke every handler registered for the value (`aux == None`) or the
    /// given aux slot, unless a newer change of that address got there first.
    /// Must be called without holding the state lock.
    fn notify(&self, address: &str, aux: Option<&str>, seq: u64, reading: &Reading) {
        let gate = self.gate.enter();
        if !gate.claim(aux, seq) {
            return;
        }

        let handlers: Vec<Handler> = lock(&self.subscribers)
            .iter()
            .filter(|s| s.aux.as_deref() == aux)
            .map(|s| Arc::clone(&s.handler))
            .collect();

        for handler in handlers {
            // A callback rewrote this address; the rest get the newer value.
            if gate.superseded(aux, seq) {
                break;
            }
            handler.on_update(address, reading);
        }
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Item")
            .field("key", &self.def.key)
            .field("type", &self.def.data_type)
            .finish_non_exhaustive()
    }
}

fn clamp(def: &ItemDefinition, value: Value) -> Value {
    match value {
        Value::Float(mut f) => {
            if let Some(min) = def.min {
                if f < min {
                    f = min;
                }
            }
            if let Some(max) = def.max {
                if f > max {
                    f = max;
                }
            }
            Value::Float(f)
        }
        Value::Int(mut i) => {
            if let Some(min) = def.min {
                if (i as f64) < min {
                    i = min.ceil() as i64;
                }
            }
            if let Some(max) = def.max {
                if (i as f64) > max {
                    i = max.floor() as i64;
                }
            }
            Value::Int(i)
        }
        other => other,
    }
}

/// The in-memory item store.
///
/// Built once from item definitions and then shared (typically as
/// `Arc<ItemStore>`) with every component that reads or writes values.
#[derive(Default)]
pub struct ItemStore {
    items: HashMap<String, Arc<Item>>,
    /// Keys in definition order.
    order: Vec<String>,
}

impl ItemStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding one item per definition.
    pub fn from_definitions<I>(definitions: I) -> Result<Self, StoreError>
    where
        I: IntoIterator<Item = ItemDefinition>,
    {
        let mut store = Self::new();
        for def in definitions {
            store.add_item(def)?;
        }
        Ok(store)
    }

    /// Add an item. Only possible while the store is not yet shared.
    pub fn add_item(&mut self, def: ItemDefinition) -> Result<Arc<Item>, StoreError> {
        if self.items.contains_key(&def.key) {
            return Err(StoreError::DuplicateKey(def.key));
        }
        let key = def.key.clone();
        let item = Arc::new(Item::new(def)?);
        self.items.insert(key.clone(), Arc::clone(&item));
        self.order.push(key);
        Ok(item)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Whether the key (or `key.aux` address) is defined.
    pub fn contains(&self, address: &str) -> bool {
        let (key, aux) = split_address(address);
        match (self.items.get(key), aux) {
            (Some(item), Some(aux)) => item.has_aux(aux),
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// All item keys in definition order.
    pub fn list_keys(&self) -> &[String] {
        &self.order
    }

    /// Direct handle to an item, for callers that need its metadata.
    pub fn get_raw(&self, key: &str) -> Result<Arc<Item>, StoreError> {
        self.items
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::KeyNotFound(key.to_string()))
    }

    /// Static description of an item.
    pub fn describe(&self, key: &str) -> Result<ItemDefinition, StoreError> {
        Ok(self.item(key)?.def.clone())
    }

    /// Read an item report, or an aux value for `key.aux` addresses.
    pub fn read(&self, address: &str) -> Result<Reading, StoreError> {
        let (key, aux) = split_address(address);
        let item = self.item(key)?;
        match aux {
            Some(aux) => Ok(Reading::Aux(item.aux_value(aux)?)),
            None => Ok(Reading::Item(item.report())),
        }
    }

    /// Read the report of a plain item key.
    pub fn read_item(&self, key: &str) -> Result<ItemReport, StoreError> {
        Ok(self.item(key)?.report())
    }

    /// Write a value to a key or a `key.aux` address.
    ///
    /// The value is converted to the item's type and clamped to its bounds.
    /// Writing an item value refreshes its timestamp and clears `old`; an aux
    /// write only touches that aux slot. Subscribers are notified before this
    /// returns if anything changed.
    ///
    /// A value that cannot be converted is logged and dropped: the previous
    /// value and timestamp are kept and `BadValue` is returned.
    pub fn write(&self, address: &str, value: impl Into<Value>) -> Result<Reading, StoreError> {
        let value = value.into();
        let (key, aux) = split_address(address);
        let item = self.item(key)?;

        match aux {
            Some(aux) => {
                if !item.has_aux(aux) {
                    return Err(StoreError::KeyNotFound(address.to_string()));
                }
                let (aux_value, seq) = item.write_aux(aux, &value)?;
                let reading = Reading::Aux(aux_value);
                if let Some(seq) = seq {
                    item.notify(address, Some(aux), seq, &reading);
                }
                Ok(reading)
            }
            None => {
                let (report, seq) = item.write_value(&value, None)?;
                let reading = Reading::Item(report);
                if let Some(seq) = seq {
                    item.notify(key, None, seq, &reading);
                }
                Ok(reading)
            }
        }
    }

    /// Write a value together with the writer-controlled quality flags
    /// (`annunciate`, `bad`, `fail`, `secFail`). `old` is managed by the
    /// store and is always cleared by a write.
    pub fn write_with_flags(
        &self,
        key: &str,
        value: impl Into<Value>,
        flags: Flags,
    ) -> Result<ItemReport, StoreError> {
        let value = value.into();
        let item = self.item(key)?;
        let (report, seq) = item.write_value(&value, Some(flags))?;
        if let Some(seq) = seq {
            item.notify(key, None, seq, &Reading::Item(report.clone()));
        }
        Ok(report)
    }

    /// Set a single quality flag by letter (`a o b f s`) or name.
    ///
    /// Nothing is notified when the flag already has the requested state.
    pub fn set_flag(&self, key: &str, flag: &str, on: bool) -> Result<ItemReport, StoreError> {
        let item = self.item(key)?;
        let kind: FlagKind = flag.parse()?;
        let (report, seq) = item.set_flag(kind, on);
        if let Some(seq) = seq {
            item.notify(key, None, seq, &Reading::Item(report.clone()));
        }
        Ok(report)
    }

    /// Register a handler for changes to a key or `key.aux` address.
    pub fn subscribe(&self, owner: &str, address: &str, handler: Handler) -> Result<(), StoreError> {
        let (key, aux) = split_address(address);
        let item = self.item(key)?;
        if let Some(aux) = aux {
            if !item.has_aux(aux) {
                return Err(StoreError::KeyNotFound(address.to_string()));
            }
        }

        let mut subscribers = lock(&item.subscribers);
        let duplicate = subscribers.iter().any(|s| {
            s.owner == owner && s.aux.as_deref() == aux && same_handler(&s.handler, &handler)
        });
        if duplicate {
            return Err(StoreError::DuplicateSubscription {
                owner: owner.to_string(),
                address: address.to_string(),
            });
        }
        subscribers.push(Subscriber {
            owner: owner.to_string(),
            aux: aux.map(String::from),
            handler,
        });
        debug!(owner, address, "Subscribed");
        Ok(())
    }

    /// Remove one subscription. Returns whether anything was removed.
    pub fn unsubscribe(&self, owner: &str, address: &str, handler: &Handler) -> Result<bool, StoreError> {
        let (key, aux) = split_address(address);
        let item = self.item(key)?;

        let mut subscribers = lock(&item.subscribers);
        let before = subscribers.len();
        subscribers.retain(|s| {
            !(s.owner == owner && s.aux.as_deref() == aux && same_handler(&s.handler, handler))
        });
        Ok(subscribers.len() != before)
    }

    /// Remove every subscription held by `owner` across all items.
    pub fn unsubscribe_all(&self, owner: &str) -> usize {
        let mut removed = 0;
        for item in self.items.values() {
            let mut subscribers = lock(&item.subscribers);
            let before = subscribers.len();
            subscribers.retain(|s| s.owner != owner);
            removed += before - subscribers.len();
        }
        if removed > 0 {
            debug!(owner, removed, "Removed subscriptions");
        }
        removed
    }

    /// Mark every item whose time-to-live has elapsed as `old`.
    ///
    /// Returns the number of items that became stale.
    pub fn sweep_stale(&self) -> usize {
        self.sweep_stale_at(Instant::now())
    }

    /// Staleness sweep against an explicit point in time.
    pub fn sweep_stale_at(&self, now: Instant) -> usize {
        let mut count = 0;
        for key in &self.order {
            let item = &self.items[key];
            if let Some((report, seq)) = item.mark_stale_at(now) {
                count += 1;
                item.notify(key, None, seq, &Reading::Item(report));
            }
        }
        count
    }

    fn item(&self, key: &str) -> Result<&Arc<Item>, StoreError> {
        self.items
            .get(key)
            .ok_or_else(|| StoreError::KeyNotFound(key.to_string()))
    }
}

impl fmt::Debug for ItemStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemStore")
            .field("keys", &self.order)
            .finish()
    }
}
