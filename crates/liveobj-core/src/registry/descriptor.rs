//! Type descriptors and the per-type hooks the codec consults.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::expr::ClientMethod;
use crate::protocol::{ClientMethodDef, FunctionId, TypeInfo};
use crate::value::{Object, Properties, Value};

/// How instances of a type cross the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReferencePolicy {
    /// Copied; the receiver gets an independent, untracked instance.
    Value,
    /// Tracked by id; the first occurrence in a payload carries a snapshot.
    RefWithSnapshot,
    /// Tracked by id; never carries a snapshot.
    RefOnly,
}

impl ReferencePolicy {
    pub fn is_tracked(self) -> bool {
        !matches!(self, ReferencePolicy::Value)
    }

    pub fn carries_snapshot(self) -> bool {
        !matches!(self, ReferencePolicy::RefOnly)
    }
}

pub type SerializeFn = dyn Fn(&Object) -> Result<Properties> + Send + Sync;
pub type DeserializeFn = dyn Fn(Properties) -> Result<Value> + Send + Sync;

/// Custom snapshot conversion for a type. Both sides must hold the same pair.
#[derive(Clone)]
pub struct SerializationHooks {
    pub serialize: Arc<SerializeFn>,
    pub deserialize: Arc<DeserializeFn>,
}

impl SerializationHooks {
    pub fn new<S, D>(serialize: S, deserialize: D) -> Self
    where
        S: Fn(&Object) -> Result<Properties> + Send + Sync + 'static,
        D: Fn(Properties) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            serialize: Arc::new(serialize),
            deserialize: Arc::new(deserialize),
        }
    }
}

impl fmt::Debug for SerializationHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SerializationHooks")
    }
}

/// Builds a native object from a received by-value snapshot.
pub type Factory = Arc<dyn Fn(Properties) -> Result<Object> + Send + Sync>;

/// What the codec needs to know about a type, on either side.
#[derive(Debug, Clone)]
pub struct TypeShape {
    pub name: String,
    pub policy: ReferencePolicy,
    pub hooks: Option<SerializationHooks>,
}

/// Server-side record of a registered type.
pub struct TypeDescriptor {
    pub name: String,
    pub policy: ReferencePolicy,
    pub(crate) methods: BTreeMap<String, FunctionId>,
    pub(crate) client_methods: BTreeMap<String, ClientMethod>,
    pub(crate) hooks: Option<SerializationHooks>,
    pub(crate) factory: Option<Factory>,
}

impl TypeDescriptor {
    pub(crate) fn new(name: String, policy: ReferencePolicy) -> Self {
        Self {
            name,
            policy,
            methods: BTreeMap::new(),
            client_methods: BTreeMap::new(),
            hooks: None,
            factory: None,
        }
    }

    pub fn method(&self, name: &str) -> Option<FunctionId> {
        self.methods.get(name).copied()
    }

    pub fn methods(&self) -> impl Iterator<Item = (&str, FunctionId)> {
        self.methods.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn has_hooks(&self) -> bool {
        self.hooks.is_some()
    }

    pub fn shape(&self) -> TypeShape {
        TypeShape {
            name: self.name.clone(),
            policy: self.policy,
            hooks: self.hooks.clone(),
        }
    }

    /// Description sent to clients.
    pub fn to_wire(&self) -> TypeInfo {
        TypeInfo {
            name: self.name.clone(),
            policy: self.policy,
            methods: self.methods.clone(),
            client_methods: self
                .client_methods
                .iter()
                .map(|(name, m)| {
                    (
                        name.clone(),
                        ClientMethodDef {
                            args: m.args().to_vec(),
                            body: m.body().to_string(),
                        },
                    )
                })
                .collect(),
            serializer: self.hooks.as_ref().map(|_| self.name.clone()),
        }
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("methods", &self.methods)
            .field("hooks", &self.hooks.is_some())
            .finish()
    }
}
