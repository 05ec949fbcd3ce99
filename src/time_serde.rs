//! `std::time::SystemTime` has no native serde impl; round-trip it as
//! seconds+nanos since the Unix epoch wherever a type needs to serialize a
//! timestamp to JSON (hash cache entries, chunk sidecars).

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Serialize, Deserialize)]
struct Repr {
    secs: u64,
    nanos: u32,
}

pub fn serialize<S: Serializer>(value: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
    let duration = value.duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default();
    Repr {
        secs: duration.as_secs(),
        nanos: duration.subsec_nanos(),
    }
    .serialize(serializer)
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SystemTime, D::Error> {
    let repr = Repr::deserialize(deserializer)?;
    Ok(SystemTime::UNIX_EPOCH + Duration::new(repr.secs, repr.nanos))
}
