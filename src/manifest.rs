//! JSON device manifest: which devices exist, which functions the gateway
//! mirrors, and how they are labeled.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::cache::{Cache, ItemConfig};
use crate::error::{Error, Result};
use crate::rf::Uid;
use crate::transceiver::parse_address;

#[derive(Debug, Deserialize)]
pub struct FunctionManifest {
    pub function: u8,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub write: bool,
    /// Minimum seconds between automatic reads; 1 s when absent.
    #[serde(rename = "access period")]
    pub access_period: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct UnitManifest {
    pub address: u8,
    pub functions: HashMap<String, FunctionManifest>,
}

#[derive(Debug, Deserialize)]
pub struct DeviceManifest {
    pub address: String,
    pub units: HashMap<String, UnitManifest>,
}

pub type Manifest = HashMap<String, DeviceManifest>;

pub fn load<P: AsRef<Path>>(path: P) -> Result<Manifest> {
    let text = fs::read_to_string(&path)?;
    parse(&text)
}

pub fn parse(text: &str) -> Result<Manifest> {
    serde_json::from_str(text)
        .map_err(|e| Error::BadParameter(format!("device manifest: {}", e)))
}

/// Register every manifest function with the cache. A readable function
/// polls `fno`; a writable one owns `fno + 1` as its RPC target and gets
/// an inbound command subscription.
pub fn register(cache: &Cache, manifest: &Manifest) -> Result<()> {
    for (device_name, device) in manifest {
        let address = parse_address(&device.address)
            .map_err(|e| Error::BadParameter(e.to_string()))?;
        for (unit_name, unit) in &device.units {
            let uid = Uid {
                address,
                unit: unit.address,
            };
            for (function_name, function) in &unit.functions {
                let access_period = match function.access_period {
                    Some(seconds) if seconds > 0.0 => Some(Duration::from_secs_f64(seconds)),
                    Some(seconds) => {
                        return Err(Error::BadParameter(format!(
                            "access period {} of {}/{}/{} must be positive",
                            seconds, device_name, unit_name, function_name
                        )))
                    }
                    None => None,
                };
                if function.read {
                    cache.register_item(ItemConfig {
                        uid,
                        fno: function.function,
                        readable: true,
                        writable: false,
                        access_period,
                        device_name: device_name.clone(),
                        unit_name: unit_name.clone(),
                        function_name: function_name.clone(),
                    });
                }
                if function.write {
                    let fno = function.function.checked_add(1).ok_or_else(|| {
                        Error::BadParameter(format!(
                            "function {:#04x} of {}/{}/{} has no write companion",
                            function.function, device_name, unit_name, function_name
                        ))
                    })?;
                    cache.register_item(ItemConfig {
                        uid,
                        fno,
                        readable: false,
                        writable: true,
                        access_period: None,
                        device_name: device_name.clone(),
                        unit_name: unit_name.clone(),
                        function_name: function_name.clone(),
                    });
                    cache.subscribe_writable(uid, fno)?;
                }
            }
        }
    }
    Ok(())
}
