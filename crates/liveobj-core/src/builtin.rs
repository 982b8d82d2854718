//! By-value types every registry and client knows without a `getType`
//! round trip: `Date` and `Map`.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

use crate::error::LiveObjError;
use crate::registry::SerializationHooks;
use crate::value::{Object, Properties, RemoteObject, Value};

/// A point in time, sent as `{"_type":"Date","iso":"2024-01-01T00:00:00.000Z"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(pub DateTime<Utc>);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn from_millis(millis: i64) -> Option<Self> {
        Utc.timestamp_millis_opt(millis).single().map(Self)
    }

    pub fn millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    pub fn to_iso(&self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

impl RemoteObject for Timestamp {
    fn properties(&self) -> Properties {
        Properties::from([("iso".to_string(), Value::from(self.to_iso()))])
    }
}

pub fn timestamp_hooks() -> SerializationHooks {
    SerializationHooks::new(
        |object| {
            object
                .downcast_ref::<Timestamp>()
                .map(RemoteObject::properties)
                .ok_or_else(|| LiveObjError::invalid_params("Date hook applied to another type"))
        },
        |snapshot| {
            let iso = snapshot
                .get("iso")
                .and_then(Value::as_str)
                .ok_or_else(|| LiveObjError::protocol("Date snapshot without iso field"))?;
            let parsed = DateTime::parse_from_rfc3339(iso)
                .map_err(|e| LiveObjError::protocol(format!("invalid Date {}: {}", iso, e)))?;
            Ok(Value::Object(Object::new(Timestamp(parsed.with_timezone(&Utc)))))
        },
    )
}

/// Ordered key/value pairs with arbitrary keys, sent as
/// `{"_type":"Map","entries":[[k,v],...]}`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteMap {
    entries: Vec<(Value, Value)>,
}

impl RemoteMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (Value, Value)>) -> Self {
        let mut map = Self::new();
        for (k, v) in entries {
            map.insert(k, v);
        }
        map
    }

    /// Insert or replace.
    pub fn insert(&mut self, key: impl Into<Value>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn entries(&self) -> &[(Value, Value)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl RemoteObject for RemoteMap {
    fn properties(&self) -> Properties {
        let entries = self
            .entries
            .iter()
            .map(|(k, v)| Value::Array(vec![k.clone(), v.clone()]))
            .collect();
        Properties::from([("entries".to_string(), Value::Array(entries))])
    }
}

pub fn map_hooks() -> SerializationHooks {
    SerializationHooks::new(
        |object| {
            object
                .downcast_ref::<RemoteMap>()
                .map(RemoteObject::properties)
                .ok_or_else(|| LiveObjError::invalid_params("Map hook applied to another type"))
        },
        |snapshot| {
            let entries = snapshot
                .get("entries")
                .and_then(Value::as_array)
                .ok_or_else(|| LiveObjError::protocol("Map snapshot without entries"))?;
            let mut map = RemoteMap::new();
            for entry in entries {
                match entry.as_array() {
                    Some([k, v]) => map.insert(k.clone(), v.clone()),
                    _ => return Err(LiveObjError::protocol("Map entry must be a [key, value] pair")),
                }
            }
            Ok(Value::Object(Object::new(map)))
        },
    )
}
