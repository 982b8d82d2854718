//! Client-side type knowledge: descriptors fetched with `getType`, and the
//! statically linked serializer hooks they may name.

use std::any::TypeId;
use std::collections::{BTreeMap, HashMap};

use crate::builtin::{self, RemoteMap, Timestamp};
use crate::config::ProtocolConfig;
use crate::error::Result;
use crate::expr::ClientMethod;
use crate::protocol::{FunctionId, TypeInfo};
use crate::registry::{ReferencePolicy, SerializationHooks, TypeShape};
use crate::value::RemoteObject;

/// A server type as seen by this client.
#[derive(Debug)]
pub struct LocalType {
    name: String,
    policy: ReferencePolicy,
    methods: BTreeMap<String, FunctionId>,
    client_methods: BTreeMap<String, ClientMethod>,
    serializer: Option<String>,
}

impl LocalType {
    pub(crate) fn from_info(info: TypeInfo) -> Result<Self> {
        let client_methods = info
            .client_methods
            .into_iter()
            .map(|(name, def)| Ok((name, ClientMethod::parse(def.args, &def.body)?)))
            .collect::<Result<_>>()?;
        Ok(Self {
            name: info.name,
            policy: info.policy,
            methods: info.methods,
            client_methods,
            serializer: info.serializer,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> ReferencePolicy {
        self.policy
    }

    pub fn method(&self, name: &str) -> Option<FunctionId> {
        self.methods.get(name).copied()
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub fn client_method(&self, name: &str) -> Option<&ClientMethod> {
        self.client_methods.get(name)
    }

    pub(crate) fn shape(&self, hooks: &HookLibrary) -> TypeShape {
        TypeShape {
            name: self.name.clone(),
            policy: self.policy,
            hooks: self
                .serializer
                .as_deref()
                .and_then(|key| hooks.get(key))
                .cloned(),
        }
    }
}

/// Serializer hooks known to the client, keyed by the name a type
/// description refers to. `Date` and `Map` are always present.
#[derive(Clone)]
pub struct HookLibrary {
    by_name: HashMap<String, SerializationHooks>,
    by_native: HashMap<TypeId, String>,
}

impl Default for HookLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl HookLibrary {
    pub fn new() -> Self {
        let mut library = Self {
            by_name: HashMap::new(),
            by_native: HashMap::new(),
        };
        library.register::<Timestamp>(ProtocolConfig::DATE_TYPE_NAME, builtin::timestamp_hooks());
        library.register::<RemoteMap>(ProtocolConfig::MAP_TYPE_NAME, builtin::map_hooks());
        library
    }

    /// Hooks for a native by-value type the client can also send.
    pub fn register<T: RemoteObject>(&mut self, name: &str, hooks: SerializationHooks) {
        self.by_native.insert(TypeId::of::<T>(), name.to_string());
        self.by_name.insert(name.to_string(), hooks);
    }

    pub fn get(&self, name: &str) -> Option<&SerializationHooks> {
        self.by_name.get(name)
    }

    pub(crate) fn name_of(&self, native: TypeId) -> Option<&str> {
        self.by_native.get(&native).map(String::as_str)
    }

    /// Shape of a by-value type known without a `getType` round trip.
    pub(crate) fn value_shape(&self, name: &str) -> Option<TypeShape> {
        self.get(name).map(|hooks| TypeShape {
            name: name.to_string(),
            policy: ReferencePolicy::Value,
            hooks: Some(hooks.clone()),
        })
    }
}

impl std::fmt::Debug for HookLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookLibrary")
            .field("names", &self.by_name.keys().collect::<Vec<_>>())
            .finish()
    }
}
