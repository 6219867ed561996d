//! RF model: synchronous RPC to device functions plus the discovered
//! capability cache that drives the typed codec.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info};

use crate::error::{Error, Result};
use crate::protocol::{self, Request, RC_OK};
use crate::transceiver::{format_address, Address, MessageStatus, Transmitter};
use crate::value::{DataType, Value};

pub type FuncNo = u8;

/// Function 0 of any unit describes that unit; on unit 0 it enumerates the
/// device itself.
pub const F_GET_LIST_OF_UNIT_FUNCTIONS: FuncNo = 0;

/// Link failures are retried this many times before the device is declared
/// unreachable.
pub const CALL_ATTEMPTS: usize = 3;

/// Discovered capabilities go stale after this long.
const UNIT_CACHE_TTL: Duration = Duration::from_secs(3600);

/// A function namespace: device address plus unit id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Uid {
    pub address: Address,
    pub unit: u8,
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{:02X}", format_address(&self.address), self.unit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnitFunctionKey {
    pub uid: Uid,
    pub fno: FuncNo,
}

/// Declared capability of one function: what it returns when read and what
/// it expects when written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitFunction {
    pub read: DataType,
    pub write: DataType,
}

/// A device with one transceiver and multiple units in it.
#[derive(Debug, Clone)]
pub struct Device {
    pub address: Address,
    pub last_discovered: Instant,
    pub unit_count: u8,
    pub build_number: u32,
    pub functions: Vec<UnitFunctionKey>,
}

#[derive(Default)]
struct UnitCache {
    devices: HashMap<Address, Device>,
    functions: HashMap<UnitFunctionKey, UnitFunction>,
}

/// The upper protocol handle. Owns the transmitter and the capability
/// registry; everything is internally synchronized, callers share it
/// behind an `Arc`.
pub struct RfModel {
    transmitter: Mutex<Box<dyn Transmitter + Send>>,
    transaction_id: AtomicU8,
    units: Mutex<UnitCache>,
    ttl: Duration,
}

impl RfModel {
    pub fn new(transmitter: Box<dyn Transmitter + Send>) -> RfModel {
        RfModel::with_ttl(transmitter, UNIT_CACHE_TTL)
    }

    pub fn with_ttl(transmitter: Box<dyn Transmitter + Send>, ttl: Duration) -> RfModel {
        RfModel {
            transmitter: Mutex::new(transmitter),
            transaction_id: AtomicU8::new(0),
            units: Mutex::new(UnitCache::default()),
            ttl,
        }
    }

    pub fn close(&self) {
        self.transmitter.lock().unwrap().close();
    }

    // One counter for the whole process; collisions across devices are
    // bounded by the retry window.
    fn next_transaction_id(&self) -> u8 {
        self.transaction_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Call `fno` on `uid` with a raw payload and return the raw response
    /// data.
    ///
    /// Link failures and invalid frames are retried up to [`CALL_ATTEMPTS`]
    /// times with the same transaction id; a nonzero function return code
    /// fails immediately.
    pub fn call_function(&self, uid: Uid, fno: FuncNo, data: &[u8]) -> Result<Vec<u8>> {
        let request = Request {
            version: protocol::PROTOCOL_VERSION,
            transaction_id: self.next_transaction_id(),
            unit_id: uid.unit,
            function_id: fno,
            data: data.to_vec(),
        };
        let packet = protocol::serialize_request(&request)?;
        for attempt in 1..=CALL_ATTEMPTS {
            let message = match self
                .transmitter
                .lock()
                .unwrap()
                .send_command(uid.address, &packet)
            {
                Ok(message) => message,
                Err(e) => {
                    debug!("{} fno {:#04x} attempt {}: link fault: {}", uid, fno, attempt, e);
                    continue;
                }
            };
            if message.status != MessageStatus::DataPacket {
                debug!(
                    "{} fno {:#04x} attempt {}: link status {:?}",
                    uid, fno, attempt, message.status
                );
                continue;
            }
            let response = match protocol::parse_response(&message.payload) {
                Ok(response) => response,
                Err(e) => {
                    debug!("{} fno {:#04x} attempt {}: {}", uid, fno, attempt, e);
                    continue;
                }
            };
            if let Err(e) =
                protocol::validate_response(&request, &response, &message.address, &uid.address)
            {
                debug!("{} fno {:#04x} attempt {}: {}", uid, fno, attempt, e);
                continue;
            }
            if response.code != RC_OK {
                return Err(Error::BadCode {
                    code: response.code,
                });
            }
            return Ok(response.data);
        }
        Err(Error::DeviceTimeout)
    }

    /// Read `fno` and decode the payload per the declared read type.
    pub fn read_function(&self, uid: Uid, fno: FuncNo) -> Result<Value> {
        self.check_device_units(uid)?;
        let payload = self.call_function(uid, fno, &[])?;
        let declared = self.unit_function(uid, fno).read;
        Value::decode(declared, &payload)
    }

    /// Encode `value` per the declared write type and call `fno` with it.
    pub fn write_function(&self, uid: Uid, fno: FuncNo, value: &Value) -> Result<()> {
        self.check_device_units(uid)?;
        let declared = self.unit_function(uid, fno).write;
        let payload = encode_for(declared, value)?;
        self.call_function(uid, fno, &payload)?;
        Ok(())
    }

    /// Parse a text-form value per the declared write type and write it.
    pub fn write_function_text(&self, uid: Uid, fno: FuncNo, text: &str) -> Result<()> {
        self.check_device_units(uid)?;
        let declared = self.unit_function(uid, fno).write;
        let value = Value::parse(declared, text)?;
        self.call_function(uid, fno, &value.encode()?)?;
        Ok(())
    }

    /// Capability of `(uid, fno)`; functions the device did not declare
    /// read and write nothing.
    fn unit_function(&self, uid: Uid, fno: FuncNo) -> UnitFunction {
        self.units
            .lock()
            .unwrap()
            .functions
            .get(&UnitFunctionKey { uid, fno })
            .copied()
            .unwrap_or(UnitFunction {
                read: DataType::None,
                write: DataType::None,
            })
    }

    /// Make sure capabilities for the device are known and fresh.
    fn check_device_units(&self, uid: Uid) -> Result<()> {
        {
            let units = self.units.lock().unwrap();
            if let Some(device) = units.devices.get(&uid.address) {
                if device.last_discovered.elapsed() < self.ttl {
                    return Ok(());
                }
            }
        }
        self.update_device_units(uid.address)
    }

    /// Discovery handshake: unit 0 function 0 yields the unit count and
    /// firmware build, then function 0 of every unit yields `{fno,
    /// type_byte}` pairs. Stale mappings for the device are dropped before
    /// re-population.
    fn update_device_units(&self, address: Address) -> Result<()> {
        let summary = self.call_function(
            Uid { address, unit: 0 },
            F_GET_LIST_OF_UNIT_FUNCTIONS,
            &[],
        )?;
        if summary.len() != 5 {
            return Err(Error::BadResponse(format!(
                "incorrect response {:02X?} from device {} unit 0 enumeration",
                summary,
                format_address(&address)
            )));
        }
        let unit_count = summary[0];
        let build_number = LittleEndian::read_u32(&summary[1..5]);

        {
            let mut units = self.units.lock().unwrap();
            if let Some(old) = units.devices.remove(&address) {
                for key in old.functions {
                    units.functions.remove(&key);
                }
            }
            units.devices.insert(
                address,
                Device {
                    address,
                    last_discovered: Instant::now(),
                    unit_count,
                    build_number,
                    functions: Vec::new(),
                },
            );
        }

        for unit in 1..=unit_count {
            let uid = Uid { address, unit };
            let list = self.call_function(uid, F_GET_LIST_OF_UNIT_FUNCTIONS, &[])?;
            if list.len() % 2 != 0 {
                return Err(Error::BadResponse(format!(
                    "incorrect function list {:02X?} from unit {}",
                    list, uid
                )));
            }
            let mut units = self.units.lock().unwrap();
            for pair in list.chunks(2) {
                let key = UnitFunctionKey { uid, fno: pair[0] };
                units.functions.insert(
                    key,
                    UnitFunction {
                        read: DataType::from_code(pair[1] >> 4),
                        write: DataType::from_code(pair[1] & 0x0F),
                    },
                );
                if let Some(device) = units.devices.get_mut(&address) {
                    device.functions.push(key);
                }
            }
        }
        info!(
            "discovered {}: {} units, build {}",
            format_address(&address),
            unit_count,
            build_number
        );
        Ok(())
    }
}

fn encode_for(declared: DataType, value: &Value) -> Result<Vec<u8>> {
    match declared {
        DataType::None | DataType::Unspecified => Err(Error::General(format!(
            "unexpected input data format {:?} for value {}",
            declared, value
        ))),
        _ if value.data_type() != declared => Err(Error::General(format!(
            "value {} does not match declared type {:?}",
            value, declared
        ))),
        _ => value.encode(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transceiver::Message;
    use std::sync::Arc;

    const ADDRESS: Address = [0xAA, 0xAA, 0xAA, 0xAA, 0x01];

    /// Scripted single-device link: answers discovery from a declared
    /// function table, serves canned read payloads, records everything.
    #[derive(Default)]
    struct FakeState {
        unit_count: u8,
        build_number: u32,
        // unit -> flattened {fno, type_byte} pairs
        function_lists: HashMap<u8, Vec<u8>>,
        read_payloads: HashMap<(u8, FuncNo), Vec<u8>>,
        fail_next: usize,
        bad_code: Option<u8>,
        bad_summary: bool,
        // (transaction_id, unit, fno, data)
        requests: Vec<(u8, u8, FuncNo, Vec<u8>)>,
    }

    #[derive(Clone)]
    struct FakeLink(Arc<Mutex<FakeState>>);

    impl FakeLink {
        fn new(state: FakeState) -> FakeLink {
            FakeLink(Arc::new(Mutex::new(state)))
        }

        fn discoveries(&self) -> usize {
            self.0
                .lock()
                .unwrap()
                .requests
                .iter()
                .filter(|(_, unit, fno, _)| *unit == 0 && *fno == 0)
                .count()
        }

        fn sent_to(&self, unit: u8, fno: FuncNo) -> Vec<Vec<u8>> {
            self.0
                .lock()
                .unwrap()
                .requests
                .iter()
                .filter(|(_, u, f, _)| *u == unit && *f == fno)
                .map(|(_, _, _, data)| data.clone())
                .collect()
        }
    }

    impl Transmitter for FakeLink {
        fn send_command(&mut self, address: Address, data: &[u8]) -> Result<Message> {
            let mut state = self.0.lock().unwrap();
            let transaction_id = data[1];
            let unit = data[2];
            let fno = data[3];
            state
                .requests
                .push((transaction_id, unit, fno, data[4..].to_vec()));
            if state.fail_next > 0 {
                state.fail_next -= 1;
                return Ok(Message::status_only(MessageStatus::SlaveTimeout, address));
            }
            let (code, body): (u8, Vec<u8>) = if fno == F_GET_LIST_OF_UNIT_FUNCTIONS {
                if unit == 0 {
                    if state.bad_summary {
                        (RC_OK, vec![1, 0])
                    } else {
                        let mut body = vec![state.unit_count];
                        let mut build = [0u8; 4];
                        LittleEndian::write_u32(&mut build, state.build_number);
                        body.extend_from_slice(&build);
                        (RC_OK, body)
                    }
                } else {
                    (
                        RC_OK,
                        state.function_lists.get(&unit).cloned().unwrap_or_default(),
                    )
                }
            } else if let Some(code) = state.bad_code {
                (code, Vec::new())
            } else {
                (
                    RC_OK,
                    state
                        .read_payloads
                        .get(&(unit, fno))
                        .cloned()
                        .unwrap_or_default(),
                )
            };
            let mut payload = vec![protocol::PROTOCOL_VERSION, transaction_id, code];
            payload.extend_from_slice(&body);
            Ok(Message {
                status: MessageStatus::DataPacket,
                address,
                payload,
            })
        }
    }

    fn one_unit_device() -> FakeState {
        let mut state = FakeState {
            unit_count: 1,
            build_number: 7,
            ..Default::default()
        };
        // fno 0x18 reads a byte; fno 0x19 is its write companion
        state
            .function_lists
            .insert(1, vec![0x18, 0x20, 0x19, 0x02]);
        state.read_payloads.insert((1, 0x18), vec![0xE1]);
        state
    }

    fn uid(unit: u8) -> Uid {
        Uid {
            address: ADDRESS,
            unit,
        }
    }

    #[test]
    fn read_decodes_declared_type() {
        let link = FakeLink::new(one_unit_device());
        let rf = RfModel::new(Box::new(link.clone()));
        let value = rf.read_function(uid(1), 0x18).unwrap();
        assert_eq!(value, Value::Byte(0xE1));
        assert_eq!(value.to_string(), "225");
    }

    #[test]
    fn undeclared_function_reads_none() {
        let link = FakeLink::new(one_unit_device());
        let rf = RfModel::new(Box::new(link));
        assert_eq!(rf.read_function(uid(1), 0x55).unwrap(), Value::None);
    }

    #[test]
    fn discovery_is_cached_within_ttl() {
        let link = FakeLink::new(one_unit_device());
        let rf = RfModel::new(Box::new(link.clone()));
        rf.read_function(uid(1), 0x18).unwrap();
        rf.read_function(uid(1), 0x18).unwrap();
        assert_eq!(link.discoveries(), 1);
    }

    #[test]
    fn discovery_repeats_once_stale() {
        let link = FakeLink::new(one_unit_device());
        let rf = RfModel::with_ttl(Box::new(link.clone()), Duration::from_secs(0));
        rf.read_function(uid(1), 0x18).unwrap();
        rf.read_function(uid(1), 0x18).unwrap();
        assert_eq!(link.discoveries(), 2);
    }

    #[test]
    fn link_failures_are_retried_within_budget() {
        for fail_next in 1..CALL_ATTEMPTS {
            let mut state = one_unit_device();
            state.fail_next = fail_next;
            let link = FakeLink::new(state);
            let rf = RfModel::new(Box::new(link));
            assert_eq!(rf.call_function(uid(0), 0, &[]).unwrap().len(), 5);
        }
    }

    #[test]
    fn exhausted_retries_time_out() {
        let mut state = one_unit_device();
        state.fail_next = CALL_ATTEMPTS;
        let link = FakeLink::new(state);
        let rf = RfModel::new(Box::new(link.clone()));
        assert!(matches!(
            rf.call_function(uid(0), 0, &[]),
            Err(Error::DeviceTimeout)
        ));
        // all three attempts hit the air
        assert_eq!(link.discoveries(), CALL_ATTEMPTS);
    }

    #[test]
    fn bad_code_fails_on_first_attempt() {
        let mut state = one_unit_device();
        state.bad_code = Some(0xA0);
        let link = FakeLink::new(state);
        let rf = RfModel::new(Box::new(link.clone()));
        match rf.call_function(uid(1), 0x18, &[]) {
            Err(Error::BadCode { code }) => assert_eq!(code, 0xA0),
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(link.sent_to(1, 0x18).len(), 1);
    }

    #[test]
    fn write_encodes_declared_type() {
        let link = FakeLink::new(one_unit_device());
        let rf = RfModel::new(Box::new(link.clone()));
        rf.write_function(uid(1), 0x19, &Value::Byte(0xE1)).unwrap();
        rf.write_function_text(uid(1), 0x19, "17").unwrap();
        assert_eq!(link.sent_to(1, 0x19), vec![vec![0xE1], vec![0x11]]);
    }

    #[test]
    fn write_rejects_type_mismatch() {
        let link = FakeLink::new(one_unit_device());
        let rf = RfModel::new(Box::new(link));
        assert!(matches!(
            rf.write_function(uid(1), 0x19, &Value::Int32(3)),
            Err(Error::General(_))
        ));
        // fno 0x18 declares no write type at all
        assert!(matches!(
            rf.write_function(uid(1), 0x18, &Value::Byte(1)),
            Err(Error::General(_))
        ));
    }

    #[test]
    fn malformed_enumeration_is_a_bad_response() {
        let mut state = one_unit_device();
        state.bad_summary = true;
        let link = FakeLink::new(state);
        let rf = RfModel::new(Box::new(link));
        assert!(matches!(
            rf.read_function(uid(1), 0x18),
            Err(Error::BadResponse(_))
        ));
    }

    #[test]
    fn discovery_enumerates_every_unit() {
        let mut state = FakeState {
            unit_count: 2,
            build_number: 42,
            ..Default::default()
        };
        state.function_lists.insert(1, vec![0x10, 0x30]);
        state.function_lists.insert(2, vec![0x10, 0x40, 0x20, 0x10]);
        state.read_payloads.insert((1, 0x10), vec![5, 0, 0, 0]);
        state.read_payloads.insert((2, 0x10), b"kitchen".to_vec());
        state.read_payloads.insert((2, 0x20), vec![1]);
        let link = FakeLink::new(state);
        let rf = RfModel::new(Box::new(link));
        assert_eq!(rf.read_function(uid(1), 0x10).unwrap(), Value::Int32(5));
        assert_eq!(
            rf.read_function(uid(2), 0x10).unwrap(),
            Value::String("kitchen".into())
        );
        assert_eq!(rf.read_function(uid(2), 0x20).unwrap(), Value::Bool(true));
    }

    #[test]
    fn rediscovery_replaces_stale_capabilities() {
        let link = FakeLink::new(one_unit_device());
        let rf = RfModel::with_ttl(Box::new(link.clone()), Duration::from_secs(0));
        assert_eq!(rf.read_function(uid(1), 0x18).unwrap(), Value::Byte(0xE1));
        {
            // firmware update changes the declared type
            let mut state = link.0.lock().unwrap();
            state.function_lists.insert(1, vec![0x18, 0x40]);
            state.read_payloads.insert((1, 0x18), b"ok".to_vec());
        }
        assert_eq!(
            rf.read_function(uid(1), 0x18).unwrap(),
            Value::String("ok".into())
        );
    }

    #[test]
    fn transaction_ids_increment_and_wrap() {
        let link = FakeLink::new(one_unit_device());
        let rf = RfModel::new(Box::new(link.clone()));
        for _ in 0..260 {
            rf.call_function(uid(0), 0, &[]).unwrap();
        }
        let state = link.0.lock().unwrap();
        assert_eq!(state.requests.len(), 260);
        for (i, (transaction_id, _, _, _)) in state.requests.iter().enumerate() {
            assert_eq!(*transaction_id, i as u8);
        }
    }
}
