//! Human readable durations (`"500ms"`, `"30s"`, `"2m"`) in config files.

use serde::{Deserialize, Deserializer, de};
use std::time::Duration;

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    humantime::parse_duration(&s).map_err(de::Error::custom)
}
