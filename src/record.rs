//! Aggregated device records.

use std::fmt;

use crate::store::AggregationSet;
use crate::{Address, Uuid};

/// Placeholder rendered for attributes whose read failed.
pub const UNAVAILABLE: &str = "<unavailable>";

/// A decoded attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Text attribute, cut at the first NUL and trimmed
    Text(String),
    /// Raw bytes, rendered as hex
    Binary(Vec<u8>),
    /// The read failed
    Unavailable,
}

impl Value {
    /// Decodes a read result. `None` means the read failed.
    pub fn decode(bytes: Option<&[u8]>, binary: bool) -> Self {
        match bytes {
            None => Value::Unavailable,
            Some(bytes) if binary => Value::Binary(bytes.to_vec()),
            Some(bytes) => {
                let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                Value::Text(String::from_utf8_lossy(&bytes[..end]).trim().to_owned())
            }
        }
    }

    /// Renders the value for the relay body, truncated to `max_len` characters.
    pub fn render(&self, max_len: usize) -> String {
        if !self.is_available() {
            return UNAVAILABLE.to_owned();
        }
        self.to_string().chars().take(max_len).collect()
    }

    /// Returns `false` for failed reads.
    pub fn is_available(&self) -> bool {
        !matches!(self, Value::Unavailable)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(text) => f.write_str(text),
            Value::Binary(bytes) => write!(f, "0x{}", hex::encode_upper(bytes)),
            Value::Unavailable => f.write_str(UNAVAILABLE),
        }
    }
}

/// One attribute of a [`Record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Characteristic type
    pub uuid: Uuid,
    /// Characteristic value handle
    pub handle: u16,
    /// Decoded value
    pub value: Value,
}

/// Everything read from one service of one device, ready to be relayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Address of the device the values were read from
    pub address: Address,
    /// The service the attributes belong to
    pub service: Uuid,
    /// Attributes in the order their reads were issued
    pub entries: Vec<Entry>,
    ready: bool,
}

impl Record {
    /// Starts an empty record that is not ready for publishing.
    pub fn new(address: Address, service: Uuid) -> Self {
        Record {
            address,
            service,
            entries: Vec::new(),
            ready: false,
        }
    }

    /// Builds a ready record from a completed aggregation set.
    pub fn from_aggregation(address: Address, set: &AggregationSet) -> Self {
        let entries = set
            .slots()
            .iter()
            .map(|slot| Entry {
                uuid: slot.uuid,
                handle: slot.handle,
                value: Value::decode(slot.value.as_deref(), slot.binary),
            })
            .collect();
        Record {
            address,
            service: set.service(),
            entries,
            ready: set.is_complete(),
        }
    }

    /// Marks a hand-built record as ready for publishing.
    pub fn seal(&mut self) {
        self.ready = true;
    }

    /// Returns `true` once the record may be published.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Number of attributes whose read failed.
    pub fn unavailable(&self) -> usize {
        self.entries.iter().filter(|entry| !entry.value.is_available()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_is_cut_and_trimmed() {
        assert_eq!(Value::decode(Some(b"  HEM-7600T \0garbage"), false), Value::Text("HEM-7600T".into()));
        assert_eq!(Value::decode(Some(b""), false), Value::Text(String::new()));
        assert_eq!(Value::decode(None, false), Value::Unavailable);
    }

    #[test]
    fn render_truncates() {
        let long = Value::Text("A".repeat(40));
        assert_eq!(long.render(31).len(), 31);

        let id = Value::decode(Some(&[0xde, 0xad, 0xbe, 0xef]), true);
        assert_eq!(id.render(31), "0xDEADBEEF");

        let wide = Value::Binary(vec![0xab; 20]);
        let rendered = wide.render(31);
        assert_eq!(rendered.len(), 31);
        assert!(rendered.starts_with("0xABAB"));

        assert_eq!(Value::Unavailable.render(31), UNAVAILABLE);
    }
}
