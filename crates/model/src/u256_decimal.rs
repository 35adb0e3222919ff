use {
    alloy::primitives::U256,
    serde::{Deserializer, Serializer, de},
    serde_with::{DeserializeAs, SerializeAs},
    std::fmt,
};

pub struct DecimalU256;

impl<'de> DeserializeAs<'de, U256> for DecimalU256 {
    fn deserialize_as<D>(deserializer: D) -> Result<U256, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserialize(deserializer)
    }
}

impl SerializeAs<U256> for DecimalU256 {
    fn serialize_as<S>(source: &U256, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serialize(source, serializer)
    }
}

pub fn serialize<S>(value: &U256, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&value.to_string())
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<U256, D::Error>
where
    D: Deserializer<'de>,
{
    struct Visitor {}
    impl de::Visitor<'_> for Visitor {
        type Value = U256;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a u256 encoded as a decimal encoded string")
        }

        fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            U256::from_str_radix(s, 10).map_err(|err| {
                de::Error::custom(format!("failed to decode {s:?} as decimal u256: {err}"))
            })
        }
    }

    deserializer.deserialize_str(Visitor {})
}

#[cfg(test)]
mod tests {
    use {super::*, serde::Deserialize, serde_json::json};

    #[derive(Debug, Deserialize, PartialEq)]
    struct Amount(#[serde(with = "super")] U256);

    #[test]
    fn parses_decimal_strings() {
        let amount: Amount = serde_json::from_value(json!("3000000000000000000000")).unwrap();
        assert_eq!(amount.0, U256::from(3_000u64) * U256::from(10u64).pow(U256::from(18)));
    }

    #[test]
    fn rejects_hex_and_numbers() {
        assert!(serde_json::from_value::<Amount>(json!("0x10")).is_err());
        assert!(serde_json::from_value::<Amount>(json!(16)).is_err());
    }
}
