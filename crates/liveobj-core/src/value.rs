//! Object model: the dynamic [`Value`] tree carried by calls and events, and
//! the [`RemoteObject`] trait implemented by everything that can be shared.
//!
//! Objects are compared by identity (the `Arc` allocation), never by content.
//! The property map of an object is its *snapshot*: it is what the codec
//! writes next to `_byRef` and what the GC walks.

use std::any::{Any, TypeId};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use serde_json::Number;

use crate::error::{LiveObjError, Result};

/// Ordered property map of an object snapshot.
pub type Properties = BTreeMap<String, Value>;

/// Type-erasure helpers, implemented for every `Send + Sync + 'static` type.
pub trait AsAny: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
    fn native_type(&self) -> TypeId;
    fn native_type_name(&self) -> &'static str;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn native_type(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn native_type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// A host object that can cross the channel.
///
/// Native types are matched to their registry entry by `TypeId`; dynamic
/// objects such as [`Instance`] report the registered name themselves through
/// [`RemoteObject::type_name`].
pub trait RemoteObject: AsAny {
    /// Current property snapshot.
    fn properties(&self) -> Properties;

    /// Replace the object's state with a fresh snapshot.
    fn assign(&self, _properties: Properties) -> Result<()> {
        Err(LiveObjError::ReadOnly {
            type_name: self.native_type_name().to_string(),
        })
    }

    /// Registered type name for objects whose Rust type is shared by many
    /// registered types.
    fn type_name(&self) -> Option<&str> {
        None
    }
}

/// Shared handle to a remote-capable object.
#[derive(Clone)]
pub struct Object(Arc<dyn RemoteObject>);

impl Object {
    pub fn new<T: RemoteObject>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn from_arc<T: RemoteObject>(value: Arc<T>) -> Self {
        Self(value)
    }

    /// Identity key; stable while any clone of this handle is alive.
    pub fn key(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    pub fn ptr_eq(&self, other: &Object) -> bool {
        self.key() == other.key()
    }

    pub fn native_type(&self) -> TypeId {
        (*self.0).native_type()
    }

    pub fn native_type_name(&self) -> &'static str {
        (*self.0).native_type_name()
    }

    pub fn type_name(&self) -> Option<&str> {
        (*self.0).type_name()
    }

    pub fn properties(&self) -> Properties {
        (*self.0).properties()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.properties().remove(key)
    }

    pub fn assign(&self, properties: Properties) -> Result<()> {
        (*self.0).assign(properties)
    }

    pub fn downcast_ref<T: RemoteObject>(&self) -> Option<&T> {
        (*self.0).as_any().downcast_ref::<T>()
    }

    pub fn downcast<T: RemoteObject>(&self) -> Option<Arc<T>> {
        self.0.clone().into_any_arc().downcast::<T>().ok()
    }

    pub fn is<T: RemoteObject>(&self) -> bool {
        self.native_type() == TypeId::of::<T>()
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.type_name().unwrap_or_else(|| self.native_type_name());
        write!(f, "Object({}@{:#x})", name, self.key())
    }
}

/// Dynamic value exchanged over the channel.
#[derive(Clone, Debug, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<Value>),
    /// Binary payload, sent on the side channel.
    Bytes(Bytes),
    /// Untyped record; encoded without any tag.
    Map(Properties),
    Object(Object),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.as_i64().and_then(|n| u64::try_from(n).ok())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Properties> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Number from a float; NaN and infinities have no JSON form and become
    /// `Null`. Integral floats are stored as integers.
    pub fn from_f64(f: f64) -> Value {
        if f.fract() == 0.0 && f.abs() < (i64::MAX as f64) {
            return Value::Number(Number::from(f as i64));
        }
        Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
    }

    /// Plain conversion from JSON; objects become untagged maps.
    pub fn from_json(json: serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// JS-like truthiness used by client method expressions.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
            Value::String(s) => !s.is_empty(),
            _ => true,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => {
                a == b || matches!((a.as_f64(), b.as_f64()), (Some(x), Some(y)) if x == y)
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{}", s),
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", item)?;
                }
                Ok(())
            }
            Value::Bytes(b) => write!(f, "[binary {} bytes]", b.len()),
            Value::Map(_) => write!(f, "[object]"),
            Value::Object(o) => write!(
                f,
                "[object {}]",
                o.type_name().unwrap_or_else(|| o.native_type_name())
            ),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n.into())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n.into())
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::from_f64(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

impl From<Properties> for Value {
    fn from(m: Properties) -> Self {
        Value::Map(m)
    }
}

impl From<Object> for Value {
    fn from(o: Object) -> Self {
        Value::Object(o)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Object whose type exists only in the registry, with a free-form property
/// map. The root object and by-value objects of types without a factory are
/// instances.
#[derive(Debug)]
pub struct Instance {
    type_name: String,
    properties: RwLock<Properties>,
}

impl Instance {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self::with_properties(type_name, Properties::new())
    }

    pub fn with_properties(type_name: impl Into<String>, properties: Properties) -> Self {
        Self {
            type_name: type_name.into(),
            properties: RwLock::new(properties),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.read().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.write().insert(key.into(), value.into());
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.write().remove(key)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Properties> {
        self.properties.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Properties> {
        self.properties.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl RemoteObject for Instance {
    fn properties(&self) -> Properties {
        self.read().clone()
    }

    fn assign(&self, properties: Properties) -> Result<()> {
        *self.write() = properties;
        Ok(())
    }

    fn type_name(&self) -> Option<&str> {
        Some(&self.type_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter(u32);

    impl RemoteObject for Counter {
        fn properties(&self) -> Properties {
            Properties::from([("count".to_string(), Value::from(self.0))])
        }
    }

    #[test]
    fn test_object_identity() {
        let a = Object::new(Counter(1));
        let b = a.clone();
        let c = Object::new(Counter(1));

        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
        assert_eq!(Value::Object(a.clone()), Value::Object(b));
        assert_ne!(Value::Object(a), Value::Object(c));
    }

    #[test]
    fn test_downcast() {
        let obj = Object::new(Counter(7));
        assert_eq!(obj.downcast_ref::<Counter>().unwrap().0, 7);
        assert!(obj.downcast_ref::<Instance>().is_none());
        assert_eq!(obj.downcast::<Counter>().unwrap().0, 7);
        assert!(obj.is::<Counter>());
    }

    #[test]
    fn test_native_object_is_read_only() {
        let obj = Object::new(Counter(1));
        match obj.assign(Properties::new()) {
            Err(LiveObjError::ReadOnly { .. }) => {}
            other => panic!("Expected ReadOnly, got {:?}", other),
        }
    }

    #[test]
    fn test_instance_assign() {
        let obj = Object::new(Instance::new("Thing"));
        assert_eq!(obj.type_name(), Some("Thing"));

        obj.assign(Properties::from([("color".to_string(), Value::from("red"))]))
            .unwrap();
        assert_eq!(obj.get("color"), Some(Value::from("red")));
    }

    #[test]
    fn test_number_equality_and_floats() {
        assert_eq!(Value::from(3), Value::from(3.0));
        assert_eq!(Value::from(f64::NAN), Value::Null);
        assert_eq!(Value::from(2.5).as_f64(), Some(2.5));
        assert_eq!(Value::from(4.0).as_i64(), Some(4));
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::from("x").to_string(), "x");
        assert_eq!(Value::from(12).to_string(), "12");
        assert_eq!(
            Value::Array(vec![Value::from(1), Value::from(2)]).to_string(),
            "1,2"
        );
        assert_eq!(Value::Null.to_string(), "null");
    }

    #[test]
    fn test_from_json_is_plain() {
        let v = Value::from_json(serde_json::json!({"a": [1, "b"], "c": null}));
        let map = v.as_map().unwrap();
        assert_eq!(map["a"], Value::Array(vec![Value::from(1), Value::from("b")]));
        assert!(map["c"].is_null());
    }
}
