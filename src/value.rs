//! Typed payload codec.
//!
//! Devices declare a data type per function; payload bytes are decoded and
//! encoded against that declaration. The text forms are what the cache
//! stores and what travels through the KV bridge.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

/// Data type codes as declared by device self-description, one nibble each
/// for the read and write direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    None,
    Bool,
    Byte,
    Int32,
    String,
    ByteArray,
    Unspecified,
}

impl DataType {
    pub fn from_code(code: u8) -> DataType {
        match code {
            0x0 => DataType::None,
            0x1 => DataType::Bool,
            0x2 => DataType::Byte,
            0x3 => DataType::Int32,
            0x4 => DataType::String,
            0x5 => DataType::ByteArray,
            _ => DataType::Unspecified,
        }
    }
}

/// A decoded function value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    None,
    Bool(bool),
    Byte(u8),
    Int32(i32),
    String(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::None => DataType::None,
            Value::Bool(_) => DataType::Bool,
            Value::Byte(_) => DataType::Byte,
            Value::Int32(_) => DataType::Int32,
            Value::String(_) => DataType::String,
            Value::Bytes(_) => DataType::ByteArray,
        }
    }

    /// Decode a response payload against the declared read type.
    pub fn decode(data_type: DataType, payload: &[u8]) -> Result<Value> {
        match data_type {
            DataType::None => Ok(Value::None),
            DataType::Bool => {
                check_length(payload, 1)?;
                Ok(Value::Bool(payload[0] != 0))
            }
            DataType::Byte => {
                check_length(payload, 1)?;
                Ok(Value::Byte(payload[0]))
            }
            DataType::Int32 => {
                check_length(payload, 4)?;
                Ok(Value::Int32(LittleEndian::read_i32(payload)))
            }
            DataType::String => match String::from_utf8(payload.to_vec()) {
                Ok(s) => Ok(Value::String(s)),
                Err(_) => Err(Error::BadResponse(format!(
                    "payload {:?} is not valid utf-8",
                    payload
                ))),
            },
            DataType::ByteArray => Ok(Value::Bytes(payload.to_vec())),
            DataType::Unspecified => Err(Error::General(format!(
                "unexpected data type for payload {:?}",
                payload
            ))),
        }
    }

    /// Encode for transmission against the declared write type.
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Value::None => Err(Error::General(
                "function does not accept a written value".into(),
            )),
            Value::Bool(v) => Ok(vec![*v as u8]),
            Value::Byte(v) => Ok(vec![*v]),
            Value::Int32(v) => {
                let mut buf = [0u8; 4];
                LittleEndian::write_i32(&mut buf, *v);
                Ok(buf.to_vec())
            }
            Value::String(s) => Ok(s.as_bytes().to_vec()),
            Value::Bytes(b) => Ok(b.clone()),
        }
    }

    /// Parse the text form commanded through the KV bridge into a value of
    /// the declared write type.
    pub fn parse(data_type: DataType, text: &str) -> Result<Value> {
        match data_type {
            DataType::Bool => match text {
                "true" | "t" | "1" => Ok(Value::Bool(true)),
                "false" | "f" | "0" => Ok(Value::Bool(false)),
                _ => Err(Error::BadParameter(format!("{:?} is not a bool", text))),
            },
            DataType::Byte => text
                .parse::<u8>()
                .map(Value::Byte)
                .map_err(|_| Error::BadParameter(format!("{:?} is not a byte", text))),
            DataType::Int32 => text
                .parse::<i32>()
                .map(Value::Int32)
                .map_err(|_| Error::BadParameter(format!("{:?} is not an int32", text))),
            DataType::String => Ok(Value::String(text.to_string())),
            DataType::ByteArray => hex::decode(text)
                .map(Value::Bytes)
                .map_err(|_| Error::BadParameter(format!("{:?} is not a hex byte array", text))),
            DataType::None | DataType::Unspecified => Err(Error::General(format!(
                "no write data type declared for value {:?}",
                text
            ))),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::None => write!(f, "0"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Byte(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "{}", s),
            Value::Bytes(b) => write!(f, "{}", hex::encode_upper(b)),
        }
    }
}

fn check_length(payload: &[u8], expected: usize) -> Result<()> {
    if payload.len() != expected {
        return Err(Error::BadResponse(format!(
            "payload {:?} length does not correspond data type length {}",
            payload, expected
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_codes() {
        assert_eq!(DataType::from_code(0), DataType::None);
        assert_eq!(DataType::from_code(3), DataType::Int32);
        assert_eq!(DataType::from_code(5), DataType::ByteArray);
        assert_eq!(DataType::from_code(0xF), DataType::Unspecified);
        assert_eq!(DataType::from_code(9), DataType::Unspecified);
    }

    #[test]
    fn bool_decode() {
        assert_eq!(
            Value::decode(DataType::Bool, &[0]).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            Value::decode(DataType::Bool, &[7]).unwrap(),
            Value::Bool(true)
        );
        assert!(Value::decode(DataType::Bool, &[0, 1]).is_err());
    }

    #[test]
    fn int32_encode_decode() {
        for v in [0i32, 1, 225, -5, i32::MAX, i32::MIN] {
            let payload = Value::Int32(v).encode().unwrap();
            assert_eq!(payload.len(), 4);
            assert_eq!(
                Value::decode(DataType::Int32, &payload).unwrap(),
                Value::Int32(v)
            );
        }
        // little endian on the wire
        assert_eq!(
            Value::Int32(-5).encode().unwrap(),
            vec![0xFB, 0xFF, 0xFF, 0xFF]
        );
        assert!(Value::decode(DataType::Int32, &[1, 2]).is_err());
    }

    #[test]
    fn each_type_round_trips_through_its_wire_form() {
        let cases = vec![
            (DataType::Bool, Value::Bool(true)),
            (DataType::Byte, Value::Byte(0xE1)),
            (DataType::Int32, Value::Int32(-123456)),
            (DataType::String, Value::String("kitchen".into())),
            (DataType::ByteArray, Value::Bytes(vec![0xC0, 0x00, 0xDB])),
        ];
        for (data_type, value) in cases {
            let payload = value.encode().unwrap();
            assert_eq!(Value::decode(data_type, &payload).unwrap(), value);
        }
    }

    #[test]
    fn text_forms_round_trip() {
        let cases = vec![
            (DataType::Bool, "true"),
            (DataType::Byte, "225"),
            (DataType::Int32, "-5"),
            (DataType::String, "hello"),
            (DataType::ByteArray, "C000DB"),
        ];
        for (data_type, text) in cases {
            let value = Value::parse(data_type, text).unwrap();
            assert_eq!(value.to_string(), text);
        }
    }

    #[test]
    fn none_renders_as_zero() {
        assert_eq!(Value::decode(DataType::None, &[9, 9]).unwrap().to_string(), "0");
    }

    #[test]
    fn parse_rejects_mismatches() {
        assert!(Value::parse(DataType::Byte, "256").is_err());
        assert!(Value::parse(DataType::Bool, "maybe").is_err());
        assert!(Value::parse(DataType::Int32, "ten").is_err());
        assert!(Value::parse(DataType::ByteArray, "XYZ").is_err());
        assert!(Value::parse(DataType::None, "1").is_err());
    }

    #[test]
    fn none_does_not_encode() {
        assert!(Value::None.encode().is_err());
    }
}
