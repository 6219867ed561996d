//! Seam between the update engine and whatever mirrors values to the
//! outside world.

use std::sync::mpsc::Receiver;

use crate::error::Result;

/// An inbound write command observed on a registered key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubMessage {
    pub key: String,
    pub value: String,
}

pub trait OutsideInterface: Send + Sync {
    /// Publish a value, overwriting whatever was there. Implementations
    /// absorb transient store failures; one lost publish is repaired by
    /// the next cycle.
    fn update(&self, key: &str, value: &str);

    /// Watch a key for external writes. Yields the key's current value
    /// first (if it has one), then every subsequent external set.
    fn subscribe_writes(&self, key: &str) -> Result<Receiver<SubMessage>>;
}
