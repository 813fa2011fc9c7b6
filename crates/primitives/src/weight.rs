//! Chain weight arithmetic.
//!
//! Weight is an aggregated comparable score over a chain; the heaviest head
//! wins fork choice. It grows without bound, hence the big integer.

/// Aggregated chain weight.
pub type Weight = num_bigint::BigInt;

/// Wire serialization of [`Weight`] values: a byte string holding a sign byte
/// (`0` positive, `1` negative) followed by the big-endian magnitude; zero is
/// the empty byte string.
pub mod bigint_ser {
    use num_bigint::{BigInt, Sign};
    use serde::{de, Deserialize, Deserializer, Serializer};

    /// Serializes a big integer as a sign-prefixed byte string.
    pub fn serialize<S: Serializer>(int: &BigInt, serializer: S) -> Result<S::Ok, S::Error> {
        let (sign, mut bytes) = int.to_bytes_be();
        let encoded = match sign {
            Sign::NoSign => Vec::new(),
            Sign::Plus => {
                bytes.insert(0, 0);
                bytes
            }
            Sign::Minus => {
                bytes.insert(0, 1);
                bytes
            }
        };
        serializer.serialize_bytes(&encoded)
    }

    /// Deserializes a big integer from its sign-prefixed byte string.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigInt, D::Error> {
        let bytes = serde_bytes::ByteBuf::deserialize(deserializer)?;
        let bytes = bytes.as_ref();
        if bytes.is_empty() {
            return Ok(BigInt::default());
        }
        let sign = match bytes[0] {
            0 => Sign::Plus,
            1 => Sign::Minus,
            other => {
                return Err(de::Error::custom(format!("invalid big integer sign byte {other}")))
            }
        };
        Ok(BigInt::from_bytes_be(sign, &bytes[1..]))
    }

}
