use std::collections::BTreeMap;

use serde::de::{Deserialize, Deserializer, Error as DeError, MapAccess, Visitor};

/// Deserialize a string-keyed map, rejecting duplicate keys.
///
/// YAML permits a mapping to repeat a key, and a plain map deserialization
/// silently keeps the last value. For cameras and zones a repeated name is a
/// configuration mistake that must fail startup, so those fields use
/// `#[serde(deserialize_with = "de_unique_map")]`.
pub fn de_unique_map<'de, D, V>(deserializer: D) -> Result<BTreeMap<String, V>, D::Error>
where
    D: Deserializer<'de>,
    V: Deserialize<'de>,
{
    struct UniqueMapVisitor<V>(std::marker::PhantomData<V>);

    impl<'de, V> Visitor<'de> for UniqueMapVisitor<V>
    where
        V: Deserialize<'de>,
    {
        type Value = BTreeMap<String, V>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a mapping with unique string keys")
        }

        fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut map = BTreeMap::new();
            while let Some((key, value)) = access.next_entry::<String, V>()? {
                if map.contains_key(&key) {
                    return Err(A::Error::custom(format!(
                        "duplicate key `{key}` is defined multiple times"
                    )));
                }
                map.insert(key, value);
            }
            Ok(map)
        }
    }

    deserializer.deserialize_map(UniqueMapVisitor(std::marker::PhantomData))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Holder {
        #[serde(deserialize_with = "de_unique_map")]
        items: BTreeMap<String, u32>,
    }

    #[test]
    fn test_unique_keys_pass() {
        let h: Holder = serde_yaml::from_str("items:\n  a: 1\n  b: 2\n").unwrap();
        assert_eq!(h.items.len(), 2);
    }

    #[test]
    fn test_duplicate_keys_fail() {
        let err = serde_yaml::from_str::<Holder>("items:\n  a: 1\n  a: 2\n").unwrap_err();
        assert!(err.to_string().contains("duplicate key `a`"));
    }
}
