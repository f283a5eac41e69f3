use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String)
}

impl RawDuration {
    fn into_duration<E: serde::de::Error>(self) -> Result<Option<Duration>, E> {
        match self {
            Self::Seconds(secs) => Ok(Some(Duration::from_secs(secs))),
            Self::Text(value) => {
                let value = value.trim();
                if value.is_empty() {
                    return Ok(None);
                }
                humantime::parse_duration(value).map(Some).map_err(E::custom)
            }
        }
    }
}

/// Accepts `30`, `"30s"`, `"5m"`, `null` or an empty string.
pub fn deserialize_optional_duration<'de, D>(
    deserializer: D
) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<RawDuration>::deserialize(deserializer)? {
        Some(raw) => raw.into_duration(),
        None => Ok(None),
    }
}

/// Same input forms as [`deserialize_optional_duration`], but a value is
/// required.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    RawDuration::deserialize(deserializer)?
        .into_duration()?
        .ok_or_else(|| D::Error::custom("duration must not be empty"))
}

/// Command-line form of the same rule: bare seconds or humantime text.
pub fn parse_duration_arg(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(value).map_err(|err| err.to_string())
}
