//! SLIP-style byte stuffing for the UART modem link.
//!
//! A packet starts with a single `0xC0` sentinel; inside the body `0xC0`
//! becomes `0xDB 0xDC` and `0xDB` becomes `0xDB 0xDD`, so the sentinel can
//! never appear after the opening byte.

use crate::error::{Error, Result};

const END: u8 = 0xC0;
const ESC: u8 = 0xDB;
const ESC_END: u8 = 0xDC;
const ESC_ESC: u8 = 0xDD;

pub fn stuff(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 1);
    out.push(END);
    for &b in data {
        match b {
            END => out.extend_from_slice(&[ESC, ESC_END]),
            ESC => out.extend_from_slice(&[ESC, ESC_ESC]),
            _ => out.push(b),
        }
    }
    out
}

pub fn unstuff(data: &[u8]) -> Result<Vec<u8>> {
    if data.first() != Some(&END) {
        return Err(Error::PacketValidation(
            "packet does not begin with 0xC0".into(),
        ));
    }
    let mut out = Vec::with_capacity(data.len());
    let mut esc = false;
    for &b in &data[1..] {
        if b == END {
            return Err(Error::PacketValidation(
                "extra 0xC0 inside a single packet".into(),
            ));
        }
        if esc {
            match b {
                ESC_END => out.push(END),
                ESC_ESC => out.push(ESC),
                other => {
                    return Err(Error::PacketValidation(format!(
                        "unexpected escape sequence 0xDB {:#04x}",
                        other
                    )))
                }
            }
            esc = false;
        } else if b == ESC {
            esc = true;
        } else {
            out.push(b);
        }
    }
    if esc {
        return Err(Error::PacketValidation(
            "unfinished escape sequence at the end of a packet".into(),
        ));
    }
    Ok(out)
}
