use std::path::Path;

use anyhow::Result;
use serde::Deserialize;

/// Reads a JSON file and reports the exact path of a failed field.
pub fn load_json_from_file<T, P>(path: P) -> Result<T>
where
    for<'de> T: Deserialize<'de>,
    P: AsRef<Path>,
{
    let data = std::fs::read_to_string(path)?;
    let de = &mut serde_json::Deserializer::from_str(&data);
    serde_path_to_error::deserialize(de).map_err(Into::into)
}

/// Human readable durations (`"1m 30s"`, `"500ms"`).
pub mod humantime {
    use std::time::Duration;

    use serde::de::{Error, Visitor};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<T, S: Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        for<'a> Serde<&'a T>: Serialize,
    {
        Serde::from(value).serialize(serializer)
    }

    pub fn deserialize<'a, T, D: Deserializer<'a>>(deserializer: D) -> Result<T, D::Error>
    where
        Serde<T>: Deserialize<'a>,
    {
        Serde::deserialize(deserializer).map(Serde::into_inner)
    }

    pub struct Serde<T>(T);

    impl<T> Serde<T> {
        #[inline]
        pub fn into_inner(self) -> T {
            self.0
        }
    }

    impl<T> From<T> for Serde<T> {
        fn from(value: T) -> Serde<T> {
            Serde(value)
        }
    }

    impl<'de> Deserialize<'de> for Serde<Duration> {
        fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Serde<Duration>, D::Error> {
            struct DurationVisitor;

            impl Visitor<'_> for DurationVisitor {
                type Value = Duration;

                fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    f.write_str("a duration")
                }

                fn visit_str<E: Error>(self, v: &str) -> Result<Duration, E> {
                    ::humantime::parse_duration(v)
                        .map_err(|_e| E::invalid_value(serde::de::Unexpected::Str(v), &self))
                }
            }

            d.deserialize_str(DurationVisitor).map(Serde)
        }
    }

    impl<'de> Deserialize<'de> for Serde<Option<Duration>> {
        fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Serde<Option<Duration>>, D::Error> {
            Ok(Serde(
                Option::<Serde<Duration>>::deserialize(d)?.map(Serde::into_inner),
            ))
        }
    }

    impl Serialize for Serde<&Duration> {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.collect_str(&::humantime::format_duration(*self.0))
        }
    }

    impl Serialize for Serde<&Option<Duration>> {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            match self.0 {
                Some(v) => serializer.serialize_some(&Serde(v)),
                None => serializer.serialize_none(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Timeouts {
        #[serde(with = "super::humantime")]
        request: Duration,
        #[serde(with = "super::humantime")]
        fetch: Option<Duration>,
    }

    #[test]
    fn humantime_durations() {
        let parsed: Timeouts =
            serde_json::from_str(r#"{"request":"1s 500ms","fetch":null}"#).unwrap();
        assert_eq!(parsed, Timeouts {
            request: Duration::from_millis(1500),
            fetch: None,
        });

        let json = serde_json::to_string(&Timeouts {
            request: Duration::from_secs(90),
            fetch: Some(Duration::from_millis(250)),
        })
        .unwrap();
        assert_eq!(json, r#"{"request":"1m 30s","fetch":"250ms"}"#);
    }
}
