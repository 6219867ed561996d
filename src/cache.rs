//! Update engine: the periodic loop that keeps registered device
//! functions mirrored against the outside KV surface.
//!
//! One cycle every 100 ms: probe each known device, then for every entry
//! of an online device flush a pending write and refresh the read value
//! when its access period has elapsed. Failures are classified onto the
//! device state and never stop the loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::outside::OutsideInterface;
use crate::rf::{FuncNo, RfModel, Uid, F_GET_LIST_OF_UNIT_FUNCTIONS};
use crate::transceiver::{format_address, Address};

pub const UPDATE_CYCLE_PERIOD: Duration = Duration::from_millis(100);
pub const DEFAULT_ACCESS_PERIOD: Duration = Duration::from_secs(1);

/// Reachability of a device as seen by the liveness probe. `Error` means
/// the device answered with something malformed or unexpected; consumers
/// treat it like `Offline`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Offline,
    Online,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    Uninitialized,
    Pending,
    Written,
    Failed,
}

/// One registered function slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key {
    pub uid: Uid,
    pub fno: FuncNo,
}

/// Registration parameters for one function slot, straight from the
/// manifest.
#[derive(Debug, Clone)]
pub struct ItemConfig {
    pub uid: Uid,
    pub fno: FuncNo,
    pub readable: bool,
    pub writable: bool,
    pub access_period: Option<Duration>,
    pub device_name: String,
    pub unit_name: String,
    pub function_name: String,
}

struct EntryState {
    readable: bool,
    writable: bool,
    read_value: String,
    last_update: SystemTime,
    last_request: SystemTime,
    access_period: Duration,
    write_value: String,
    write_state: WriteState,
    device_name: String,
    unit_name: String,
    function_name: String,
}

struct Entry {
    key: Key,
    state: Mutex<EntryState>,
}

struct CacheInner {
    rf: Arc<RfModel>,
    outside: Arc<dyn OutsideInterface>,
    entries: Mutex<HashMap<Key, Arc<Entry>>>,
    devices: Mutex<HashMap<Address, DeviceState>>,
}

/// Cheap cloneable handle on the update engine.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

/// External key for a function slot, e.g. `AA:AA:AA:AA:01:01|19`.
pub fn outside_key(uid: Uid, fno: FuncNo) -> String {
    format!("{}:{:02X}|{:02X}", format_address(&uid.address), uid.unit, fno)
}

impl Cache {
    pub fn new(rf: Arc<RfModel>, outside: Arc<dyn OutsideInterface>) -> Cache {
        Cache {
            inner: Arc::new(CacheInner {
                rf,
                outside,
                entries: Mutex::new(HashMap::new()),
                devices: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register a function slot. Idempotent: repeated registrations
    /// upgrade the existing entry in place.
    pub fn register_item(&self, config: ItemConfig) {
        let key = Key {
            uid: config.uid,
            fno: config.fno,
        };
        let entry = self.ensure_entry(key);
        let mut state = entry.state.lock().unwrap();
        state.readable |= config.readable;
        state.writable |= config.writable;
        if let Some(period) = config.access_period {
            state.access_period = period;
        }
        state.device_name = config.device_name;
        state.unit_name = config.unit_name;
        state.function_name = config.function_name;
        info!(
            "registered {} ({}/{}/{}) readable={} writable={} period={:?}",
            outside_key(key.uid, key.fno),
            state.device_name,
            state.unit_name,
            state.function_name,
            state.readable,
            state.writable,
            state.access_period
        );
    }

    /// Open the inbound write subscription for a writable slot and feed
    /// every command into the pending-write machinery.
    pub fn subscribe_writable(&self, uid: Uid, fno: FuncNo) -> Result<()> {
        let key_text = outside_key(uid, fno);
        let receiver = self.inner.outside.subscribe_writes(&key_text)?;
        let cache = self.clone();
        let name = key_text.clone();
        thread::Builder::new()
            .name(format!("sub {}", name))
            .spawn(move || {
                for message in receiver {
                    debug!("write command {} <- {:?}", message.key, message.value);
                    cache.set_cached(uid, fno, &message.value);
                }
                debug!("subscription for {} closed", name);
            })?;
        Ok(())
    }

    /// Immediate, non-blocking read of the mirrored value. Never fails;
    /// a device that is not online reads as the empty string.
    pub fn get_cached(&self, uid: Uid, fno: FuncNo) -> (String, DeviceState, SystemTime) {
        let entry = self.ensure_entry(Key { uid, fno });
        let device_state = self.device_state(uid.address);
        let mut state = entry.state.lock().unwrap();
        state.last_request = SystemTime::now();
        let value = if device_state == DeviceState::Online {
            state.read_value.clone()
        } else {
            String::new()
        };
        (value, device_state, state.last_update)
    }

    /// Store a value to be written to the device on the next cycle.
    pub fn set_cached(&self, uid: Uid, fno: FuncNo, value: &str) {
        let entry = self.ensure_entry(Key { uid, fno });
        let mut state = entry.state.lock().unwrap();
        state.write_value = value.to_string();
        state.write_state = WriteState::Pending;
    }

    /// Run update cycles forever on a dedicated thread.
    pub fn spawn_update_loop(&self) -> Result<JoinHandle<()>> {
        let cache = self.clone();
        let handle = thread::Builder::new()
            .name("update-loop".into())
            .spawn(move || {
                info!("update loop started");
                loop {
                    cache.update_cycle();
                    thread::sleep(UPDATE_CYCLE_PERIOD);
                }
            })?;
        Ok(handle)
    }

    /// One synchronous pass: device liveness first, then per-entry
    /// maintenance, writes before reads.
    pub fn update_cycle(&self) {
        let addresses: Vec<Address> = {
            self.inner.devices.lock().unwrap().keys().copied().collect()
        };
        for address in addresses {
            // unit 0 function 0 never fails on a live device
            let probe = self.inner.rf.call_function(
                Uid { address, unit: 0 },
                F_GET_LIST_OF_UNIT_FUNCTIONS,
                &[],
            );
            match probe {
                Ok(_) => {
                    self.inner
                        .devices
                        .lock()
                        .unwrap()
                        .insert(address, DeviceState::Online);
                }
                Err(e) => self.fail_device(address, &e),
            }
        }

        let entries: Vec<Arc<Entry>> = {
            self.inner.entries.lock().unwrap().values().cloned().collect()
        };
        for entry in entries {
            if self.device_state(entry.key.uid.address) != DeviceState::Online {
                continue;
            }
            self.maintain_entry(&entry);
        }
    }

    fn maintain_entry(&self, entry: &Entry) {
        let mut state = entry.state.lock().unwrap();
        if state.writable && state.write_state == WriteState::Pending {
            self.perform_write(entry.key, &mut state);
        }
        self.update_access_period(entry.key, &mut state);
        if state.readable && read_due(&state) {
            self.perform_read(entry.key, &mut state);
        }
    }

    fn perform_write(&self, key: Key, state: &mut EntryState) {
        match self
            .inner
            .rf
            .write_function_text(key.uid, key.fno, &state.write_value)
        {
            Ok(()) => {
                debug!(
                    "wrote {:?} to {}",
                    state.write_value,
                    outside_key(key.uid, key.fno)
                );
                state.write_state = WriteState::Written;
            }
            Err(e) => {
                // the device rejected the value itself; re-sending the
                // same bytes cannot succeed
                if let Error::BadCode { .. } = e {
                    state.write_state = WriteState::Failed;
                }
                self.fail_device(key.uid.address, &e);
            }
        }
    }

    fn perform_read(&self, key: Key, state: &mut EntryState) {
        match self.inner.rf.read_function(key.uid, key.fno) {
            Ok(value) => {
                state.read_value = value.to_string();
                state.last_update = SystemTime::now();
            }
            Err(e) => {
                // last_update stays: a failure marker is not fresh data
                state.read_value = format!("read failed: {}", e);
                self.fail_device(key.uid.address, &e);
            }
        }
        self.inner
            .outside
            .update(&outside_key(key.uid, key.fno), &state.read_value);
    }

    fn update_access_period(&self, _key: Key, state: &mut EntryState) {
        // adaptive pacing from the last_request rate plugs in here; until
        // a policy is settled the configured period stands
        let _ = state.last_request;
    }

    fn fail_device(&self, address: Address, error: &Error) {
        let state = match error {
            Error::DeviceTimeout => DeviceState::Offline,
            _ => DeviceState::Error,
        };
        warn!(
            "device {} marked {:?}: {}",
            format_address(&address),
            state,
            error
        );
        self.inner.devices.lock().unwrap().insert(address, state);
    }

    fn device_state(&self, address: Address) -> DeviceState {
        self.inner
            .devices
            .lock()
            .unwrap()
            .get(&address)
            .copied()
            .unwrap_or(DeviceState::Offline)
    }

    /// Fetch or create the entry for `key`. The entry is created inside
    /// the map first and locked only afterwards; its device always gets a
    /// state slot.
    fn ensure_entry(&self, key: Key) -> Arc<Entry> {
        let entry = {
            let mut entries = self.inner.entries.lock().unwrap();
            Arc::clone(entries.entry(key).or_insert_with(|| {
                Arc::new(Entry {
                    key,
                    state: Mutex::new(EntryState {
                        readable: false,
                        writable: false,
                        read_value: String::new(),
                        last_update: SystemTime::UNIX_EPOCH,
                        last_request: SystemTime::now(),
                        access_period: DEFAULT_ACCESS_PERIOD,
                        write_value: String::new(),
                        write_state: WriteState::Uninitialized,
                        device_name: String::new(),
                        unit_name: String::new(),
                        function_name: String::new(),
                    }),
                })
            }))
        };
        self.inner
            .devices
            .lock()
            .unwrap()
            .entry(key.uid.address)
            .or_insert(DeviceState::Offline);
        entry
    }
}

fn read_due(state: &EntryState) -> bool {
    SystemTime::now()
        .duration_since(state.last_update)
        .map(|elapsed| elapsed >= state.access_period)
        .unwrap_or(false)
}
