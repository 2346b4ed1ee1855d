//! Value Packing
//!
//! Values cross tier boundaries as MessagePack with named struct fields. The
//! format is self-describing, so dynamically shaped values (`serde_json::Value`,
//! untagged enums, flattened or skipped fields) read back the way they were
//! written. The local tier stores the packed bytes directly so that memory
//! accounting charges the exact serialized size.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Pack a value into its binary representation
pub fn pack<V>(value: &V) -> Result<Bytes>
where
    V: Serialize + ?Sized,
{
    rmp_serde::to_vec_named(value)
        .map(Bytes::from)
        .map_err(|e| Error::Serialization(format!("failed to pack value: {}", e)))
}

/// Unpack a value previously produced by [`pack`]
///
/// The whole payload must be consumed; a value read as a narrower type than
/// it was written with is an error, not a truncated read.
pub fn unpack<V>(packed: &[u8]) -> Result<V>
where
    V: DeserializeOwned,
{
    let mut de = rmp_serde::Deserializer::new(packed);
    let value: V = Deserialize::deserialize(&mut de)
        .map_err(|e| Error::Serialization(format!("failed to unpack value: {}", e)))?;

    let trailing = de.get_ref().len();
    if trailing > 0 {
        return Err(Error::Serialization(format!(
            "failed to unpack value: {} trailing bytes",
            trailing
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use assert_matches::assert_matches;
    use serde::Serializer;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Allocation {
        symbol: String,
        weight: f64,
        lots: Vec<u32>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(untagged)]
    enum Target {
        Amount(f64),
        Label(String),
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Goal {
        name: String,
        target: Target,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        deadline: Option<String>,
        #[serde(flatten)]
        extra: BTreeMap<String, u32>,
    }

    #[test]
    fn test_scalar_roundtrip() {
        assert_eq!(unpack::<i64>(&pack(&-42i64).unwrap()).unwrap(), -42);
        assert_eq!(unpack::<f64>(&pack(&187.42f64).unwrap()).unwrap(), 187.42);
        assert_eq!(
            unpack::<String>(&pack("AAPL").unwrap()).unwrap(),
            "AAPL".to_string()
        );
    }

    #[test]
    fn test_nested_roundtrip() {
        let mut portfolio: BTreeMap<String, Vec<Allocation>> = BTreeMap::new();
        portfolio.insert(
            "retirement".into(),
            vec![Allocation {
                symbol: "VTI".into(),
                weight: 0.6,
                lots: vec![10, 20],
            }],
        );
        portfolio.insert("brokerage".into(), vec![]);

        let packed = pack(&portfolio).unwrap();
        let restored: BTreeMap<String, Vec<Allocation>> = unpack(&packed).unwrap();
        assert_eq!(restored, portfolio);
    }

    #[test]
    fn test_dynamic_value_roundtrip() {
        let plan = json!({
            "goal": "retire",
            "allocs": [0.6, 0.4],
            "nested": { "a": 1, "b": [true, null, "x"] }
        });
        let restored: serde_json::Value = unpack(&pack(&plan).unwrap()).unwrap();
        assert_eq!(restored, plan);
    }

    #[test]
    fn test_untagged_flatten_and_skipped_fields_roundtrip() {
        let goals = vec![
            Goal {
                name: "house".into(),
                target: Target::Amount(120_000.0),
                deadline: Some("2030-01-01".into()),
                extra: [("priority".to_string(), 1)].into_iter().collect(),
            },
            Goal {
                name: "travel".into(),
                target: Target::Label("flexible".into()),
                deadline: None,
                extra: BTreeMap::new(),
            },
        ];
        let restored: Vec<Goal> = unpack(&pack(&goals).unwrap()).unwrap();
        assert_eq!(restored, goals);
    }

    #[test]
    fn test_unserializable_value() {
        struct Broken;
        impl Serialize for Broken {
            fn serialize<S: Serializer>(&self, _: S) -> std::result::Result<S::Ok, S::Error> {
                Err(serde::ser::Error::custom("not serializable"))
            }
        }

        assert_matches!(pack(&Broken), Err(Error::Serialization(_)));
    }

    #[test]
    fn test_unpack_wrong_shape() {
        let packed = pack(&1u8).unwrap();
        assert_matches!(unpack::<Allocation>(&packed), Err(Error::Serialization(_)));
    }

    #[test]
    fn test_unpack_narrower_type_rejected() {
        let packed = pack(&300u64).unwrap();
        assert_matches!(unpack::<u8>(&packed), Err(Error::Serialization(_)));
        assert_eq!(unpack::<u16>(&packed).unwrap(), 300);
    }

    #[test]
    fn test_unpack_trailing_bytes_rejected() {
        let mut packed = pack(&7u8).unwrap().to_vec();
        packed.extend_from_slice(&pack(&8u8).unwrap());
        assert_matches!(unpack::<u8>(&packed), Err(Error::Serialization(_)));
    }
}
