//! Lenient field decoding. The catalog reports numbers as JSON integers or
//! as strings depending on the field, and booleans as `0`/`1`.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    fn into_i64<E: serde::de::Error>(self) -> Result<i64, E> {
        match self {
            Scalar::Bool(value) => Ok(i64::from(value)),
            Scalar::Int(value) => Ok(value),
            Scalar::Float(value) => Ok(value as i64),
            Scalar::Text(text) => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    return Ok(0);
                }
                trimmed
                    .parse()
                    .map_err(|_| E::custom(format!("expected integer, got {trimmed:?}")))
            }
        }
    }
}

pub(crate) fn integer<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<i64>,
{
    let value = Scalar::deserialize(deserializer)?.into_i64::<D::Error>()?;
    T::try_from(value).map_err(|_| D::Error::custom(format!("integer {value} out of range")))
}

pub(crate) fn optional_integer<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<i64>,
{
    match Option::<Scalar>::deserialize(deserializer)? {
        Some(scalar) => {
            let value = scalar.into_i64::<D::Error>()?;
            T::try_from(value)
                .map(Some)
                .map_err(|_| D::Error::custom(format!("integer {value} out of range")))
        }
        None => Ok(None),
    }
}

pub(crate) fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match Scalar::deserialize(deserializer)? {
        Scalar::Text(text) if text.eq_ignore_ascii_case("true") => Ok(true),
        Scalar::Text(text) if text.eq_ignore_ascii_case("false") => Ok(false),
        other => Ok(other.into_i64::<D::Error>()? != 0),
    }
}
