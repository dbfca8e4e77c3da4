//! Self-describing application values.
//!
//! The wire codec for arbitrary application payloads is treated as an
//! external collaborator by this crate (see the purpose & scope notes): we
//! only need *some* value type that can be carried opaquely through
//! publishes and store commands, compared for equality, and serialized to
//! the wire. `Data` is the simplest thing that satisfies that without
//! pulling application schemas into the routing kernel.

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An opaque, self-describing application value.
///
/// Cheap to clone (the inner JSON tree is reference-counted by `serde_json`
/// where possible) and orderable so it can be used as a key in the ordered
/// store map (§3, Store record).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data(serde_json::Value);

/// `Data`'s own wire shape, mirroring `serde_json::Value`'s variants as a
/// plain externally-tagged enum rather than deriving through
/// `serde_json::Value` directly.
///
/// `broker-net`'s frames are `bincode`-encoded (§6), and `bincode` is not a
/// self-describing format: it cannot satisfy `Deserializer::deserialize_any`,
/// which is exactly what `serde_json::Value`'s `Deserialize` impl calls.
/// Deriving `Serialize`/`Deserialize` straight onto `Data(serde_json::Value)`
/// therefore decodes fine over `serde_json` (used by the JSON round-trip
/// test below) but fails every time the same `Data` crosses the wire inside
/// a `PUBLISH`/`STORE_CMD` frame. `Wire` is a concrete, non-`any` enum that
/// both formats can drive through ordinary `deserialize_enum`, so `Data`
/// serializes through it instead of through `serde_json::Value` directly.
#[derive(Serialize, Deserialize)]
enum Wire {
    Null,
    Bool(bool),
    I64(i64),
    U64(u64),
    F64(f64),
    Str(String),
    Array(Vec<Wire>),
    Object(Vec<(String, Wire)>),
}

fn value_to_wire(value: &serde_json::Value) -> Wire {
    match value {
        serde_json::Value::Null => Wire::Null,
        serde_json::Value::Bool(b) => Wire::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Wire::I64(i)
            } else if let Some(u) = n.as_u64() {
                Wire::U64(u)
            } else {
                Wire::F64(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Wire::Str(s.clone()),
        serde_json::Value::Array(items) => Wire::Array(items.iter().map(value_to_wire).collect()),
        serde_json::Value::Object(map) => {
            Wire::Object(map.iter().map(|(k, v)| (k.clone(), value_to_wire(v))).collect())
        }
    }
}

fn wire_to_value(wire: Wire) -> serde_json::Value {
    match wire {
        Wire::Null => serde_json::Value::Null,
        Wire::Bool(b) => serde_json::Value::Bool(b),
        Wire::I64(i) => serde_json::Value::from(i),
        Wire::U64(u) => serde_json::Value::from(u),
        Wire::F64(f) => serde_json::Number::from_f64(f).map_or(serde_json::Value::Null, serde_json::Value::Number),
        Wire::Str(s) => serde_json::Value::String(s),
        Wire::Array(items) => serde_json::Value::Array(items.into_iter().map(wire_to_value).collect()),
        Wire::Object(entries) => {
            serde_json::Value::Object(entries.into_iter().map(|(k, v)| (k, wire_to_value(v))).collect())
        }
    }
}

impl Serialize for Data {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        value_to_wire(&self.0).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Data {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = Wire::deserialize(deserializer)?;
        Ok(Self(wire_to_value(wire)))
    }
}

impl Data {
    /// The JSON `null` value, used as a placeholder where no value is present.
    #[must_use]
    pub const fn null() -> Self {
        Self(serde_json::Value::Null)
    }

    #[must_use]
    pub fn string(s: impl Into<String>) -> Self {
        Self(serde_json::Value::String(s.into()))
    }

    #[must_use]
    pub fn integer(n: i64) -> Self {
        Self(serde_json::Value::from(n))
    }

    #[must_use]
    pub fn boolean(b: bool) -> Self {
        Self(serde_json::Value::Bool(b))
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self.0, serde_json::Value::Null)
    }

    /// Borrow the underlying JSON value tree.
    #[must_use]
    pub const fn as_json(&self) -> &serde_json::Value {
        &self.0
    }
}

impl From<serde_json::Value> for Data {
    fn from(v: serde_json::Value) -> Self {
        Self(v)
    }
}

impl From<&str> for Data {
    fn from(s: &str) -> Self {
        Self::string(s)
    }
}

impl From<i64> for Data {
    fn from(n: i64) -> Self {
        Self::integer(n)
    }
}

impl fmt::Display for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// `serde_json::Value` does not implement `Ord`, but the store's key map
// (§3, Store record: `kv: ordered map<data,data>`) needs a total order.
// We order by the value's canonical JSON text representation, which is
// stable for any given value and sufficient for deterministic iteration.
impl PartialOrd for Data {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Data {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.to_string().cmp(&other.0.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_deterministic() {
        let mut values = vec![Data::integer(3), Data::integer(1), Data::string("a")];
        values.sort();
        assert_eq!(values[0], Data::integer(1));
    }

    #[test]
    fn round_trips_through_json() {
        let d = Data::string("hello");
        let encoded = serde_json::to_string(&d).unwrap();
        let decoded: Data = serde_json::from_str(&encoded).unwrap();
        assert_eq!(d, decoded);
    }

    /// `broker-net` frames carry `Data` through `bincode`, a non-self-describing
    /// format: a derive straight onto `serde_json::Value` would fail here with
    /// `DeserializeAnyNotSupported` even though the JSON round trip above
    /// passes. Pinning this at the `Data` level catches a regression before it
    /// ever reaches the wire codec.
    #[test]
    fn round_trips_through_bincode() {
        let nested = Data::from(serde_json::json!({
            "count": 3,
            "tags": ["a", "b"],
            "ratio": 0.5,
        }));
        let encoded = bincode::serialize(&nested).unwrap();
        let decoded: Data = bincode::deserialize(&encoded).unwrap();
        assert_eq!(nested, decoded);
    }
}
