//! Type and function registry.
//!
//! Populated at startup through `&mut self`, then shared read-only
//! (`Arc<Registry>`) by the server. A new registry already contains the
//! `Root` type with its built-in methods (function ids 1 to 5) and the
//! by-value built-ins `Date` and `Map`.

mod descriptor;
mod function;

pub use descriptor::{
    DeserializeFn, Factory, ReferencePolicy, SerializationHooks, SerializeFn, TypeDescriptor,
    TypeShape,
};
pub use function::{Args, NativeFn, NativeFuture};

use std::any::TypeId;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::builtin::{self, RemoteMap, Timestamp};
use crate::config::ProtocolConfig;
use crate::error::{LiveObjError, Result};
use crate::expr::ClientMethod;
use crate::protocol::{FunctionId, TypeInfo};
use crate::server::{root, CallContext};
use crate::value::{Object, Properties, RemoteObject, Value};
use function::FunctionEntry;

/// Registered types and the function table.
pub struct Registry {
    types: Vec<TypeDescriptor>,
    by_name: HashMap<String, usize>,
    by_native: HashMap<TypeId, usize>,
    functions: HashMap<FunctionId, FunctionEntry>,
    next_function_id: FunctionId,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        let mut registry = Self {
            types: Vec::new(),
            by_name: HashMap::new(),
            by_native: HashMap::new(),
            functions: HashMap::new(),
            next_function_id: 1,
        };

        // Insertion order fixes the root function ids; see `RootFunction`.
        let root = registry.insert_type(
            ProtocolConfig::ROOT_TYPE_NAME,
            ReferencePolicy::RefWithSnapshot,
            None,
        );
        registry.insert_method(root, "getType", Arc::new(root::get_type));
        registry.insert_method(root, "getObject", Arc::new(root::get_object));
        registry.insert_method(root, "pingObjects", Arc::new(root::ping_objects));
        registry.insert_method(root, "listen", Arc::new(root::listen));
        registry.insert_method(root, "unlisten", Arc::new(root::unlisten));

        let date = registry.insert_type(
            ProtocolConfig::DATE_TYPE_NAME,
            ReferencePolicy::Value,
            Some(TypeId::of::<Timestamp>()),
        );
        registry.types[date].hooks = Some(builtin::timestamp_hooks());

        let map = registry.insert_type(
            ProtocolConfig::MAP_TYPE_NAME,
            ReferencePolicy::Value,
            Some(TypeId::of::<RemoteMap>()),
        );
        registry.types[map].hooks = Some(builtin::map_hooks());

        registry
    }

    // ========================================================================
    // Types
    // ========================================================================

    /// Register a native Rust type under a wire name.
    pub fn register_type<T: RemoteObject>(
        &mut self,
        name: &str,
        policy: ReferencePolicy,
    ) -> Result<()> {
        if let Some(&index) = self.by_native.get(&TypeId::of::<T>()) {
            return Err(LiveObjError::TypeAlreadyRegistered {
                name: self.types[index].name.clone(),
            });
        }
        self.check_name_free(name)?;
        self.insert_type(name, policy, Some(TypeId::of::<T>()));
        Ok(())
    }

    /// Register a type backed by [`crate::Instance`] objects.
    pub fn register_dynamic_type(&mut self, name: &str, policy: ReferencePolicy) -> Result<()> {
        self.check_name_free(name)?;
        self.insert_type(name, policy, None);
        Ok(())
    }

    pub fn descriptor(&self, name: &str) -> Option<&TypeDescriptor> {
        self.by_name.get(name).map(|&i| &self.types[i])
    }

    pub fn descriptor_of<T: 'static>(&self) -> Option<&TypeDescriptor> {
        self.by_native
            .get(&TypeId::of::<T>())
            .map(|&i| &self.types[i])
    }

    /// Descriptor of a live object; dynamic objects are looked up by the
    /// name they report, native ones by their Rust type.
    pub fn descriptor_for(&self, object: &Object) -> Option<&TypeDescriptor> {
        match object.type_name() {
            Some(name) => self.descriptor(name),
            None => self
                .by_native
                .get(&object.native_type())
                .map(|&i| &self.types[i]),
        }
    }

    /// Wire description of a type, as returned by `getType`.
    pub fn describe(&self, name: &str) -> Option<TypeInfo> {
        self.descriptor(name).map(TypeDescriptor::to_wire)
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.iter().map(|t| t.name.as_str())
    }

    // ========================================================================
    // Methods and functions
    // ========================================================================

    /// Register a synchronous method on a native type. The type is
    /// registered by reference (with snapshot) under its short Rust name if
    /// it isn't known yet.
    pub fn register_method<T, F>(&mut self, name: &str, f: F) -> Result<FunctionId>
    where
        T: RemoteObject,
        F: Fn(&T, Args) -> Result<Value> + Send + Sync + 'static,
    {
        let index = self.ensure_native::<T>()?;
        let receiver = self.types[index].name.clone();
        let method = name.to_string();
        let func: NativeFn = Arc::new(move |_ctx: CallContext, this: Value, args: Args| {
            let result = match this.as_object().and_then(|o| o.downcast_ref::<T>()) {
                Some(target) => f(target, args),
                None => Err(wrong_receiver(&receiver, &method)),
            };
            Box::pin(futures::future::ready(result)) as NativeFuture
        });
        Ok(self.insert_method(index, name, func))
    }

    /// Register an async method on a native type.
    pub fn register_async_method<T, F, Fut>(&mut self, name: &str, f: F) -> Result<FunctionId>
    where
        T: RemoteObject,
        F: Fn(Arc<T>, CallContext, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let index = self.ensure_native::<T>()?;
        let receiver = self.types[index].name.clone();
        let method = name.to_string();
        let func: NativeFn = Arc::new(move |ctx: CallContext, this: Value, args: Args| {
            match this.as_object().and_then(|o| o.downcast::<T>()) {
                Some(target) => Box::pin(f(target, ctx, args)) as NativeFuture,
                None => Box::pin(futures::future::ready(Err(wrong_receiver(
                    &receiver, &method,
                )))) as NativeFuture,
            }
        });
        Ok(self.insert_method(index, name, func))
    }

    /// Register a raw native function as a method of a type known by name.
    pub fn register_native(
        &mut self,
        type_name: &str,
        method: &str,
        func: NativeFn,
    ) -> Result<FunctionId> {
        let index = self.index_of(type_name)?;
        Ok(self.insert_method(index, method, func))
    }

    /// Register a free function as a method of the root object.
    pub fn register_function<F>(&mut self, name: &str, f: F) -> Result<FunctionId>
    where
        F: Fn(Args) -> Result<Value> + Send + Sync + 'static,
    {
        let func: NativeFn = Arc::new(move |_ctx: CallContext, _this: Value, args: Args| {
            Box::pin(futures::future::ready(f(args))) as NativeFuture
        });
        self.register_native(ProtocolConfig::ROOT_TYPE_NAME, name, func)
    }

    /// Attach a method evaluated by the receiving client. The body is
    /// parsed now so a bad expression fails at registration.
    pub fn register_client_method<T: RemoteObject>(
        &mut self,
        name: &str,
        args: &[&str],
        body: &str,
    ) -> Result<()> {
        let index = self.ensure_native::<T>()?;
        self.insert_client_method(index, name, args, body)
    }

    /// [`Self::register_client_method`] for a dynamic type.
    pub fn register_dynamic_client_method(
        &mut self,
        type_name: &str,
        name: &str,
        args: &[&str],
        body: &str,
    ) -> Result<()> {
        let index = self.index_of(type_name)?;
        self.insert_client_method(index, name, args, body)
    }

    pub fn register_serializer<T: RemoteObject>(&mut self, hooks: SerializationHooks) -> Result<()> {
        let index = self.native_index::<T>()?;
        self.types[index].hooks = Some(hooks);
        Ok(())
    }

    /// Constructor used when a by-value snapshot of `T` arrives.
    pub fn register_factory<T, F>(&mut self, factory: F) -> Result<()>
    where
        T: RemoteObject,
        F: Fn(Properties) -> Result<T> + Send + Sync + 'static,
    {
        let index = self.native_index::<T>()?;
        self.types[index].factory = Some(Arc::new(move |snapshot| factory(snapshot).map(Object::new)));
        Ok(())
    }

    pub fn function(&self, id: FunctionId) -> Option<NativeFn> {
        self.functions.get(&id).map(|e| e.func.clone())
    }

    /// `Type.method` name of a function, for logs.
    pub fn function_name(&self, id: FunctionId) -> Option<&str> {
        self.functions.get(&id).map(|e| e.qualified_name.as_str())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn check_name_free(&self, name: &str) -> Result<()> {
        if self.by_name.contains_key(name) || name == ProtocolConfig::BUFFER_TYPE_NAME {
            return Err(LiveObjError::TypeAlreadyRegistered {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn index_of(&self, type_name: &str) -> Result<usize> {
        self.by_name
            .get(type_name)
            .copied()
            .ok_or_else(|| LiveObjError::UnknownType {
                name: type_name.to_string(),
            })
    }

    fn native_index<T: RemoteObject>(&self) -> Result<usize> {
        self.by_native
            .get(&TypeId::of::<T>())
            .copied()
            .ok_or_else(|| LiveObjError::UnregisteredType {
                type_name: std::any::type_name::<T>().to_string(),
            })
    }

    fn ensure_native<T: RemoteObject>(&mut self) -> Result<usize> {
        if let Some(&index) = self.by_native.get(&TypeId::of::<T>()) {
            return Ok(index);
        }
        let full = std::any::type_name::<T>();
        let short = full.rsplit("::").next().unwrap_or(full);
        self.register_type::<T>(short, ReferencePolicy::RefWithSnapshot)?;
        self.index_of(short)
    }

    fn insert_client_method(
        &mut self,
        index: usize,
        name: &str,
        args: &[&str],
        body: &str,
    ) -> Result<()> {
        let method = ClientMethod::parse(args.iter().map(|a| a.to_string()).collect(), body)?;
        self.types[index]
            .client_methods
            .insert(name.to_string(), method);
        Ok(())
    }

    fn insert_type(&mut self, name: &str, policy: ReferencePolicy, native: Option<TypeId>) -> usize {
        let index = self.types.len();
        self.types
            .push(TypeDescriptor::new(name.to_string(), policy));
        self.by_name.insert(name.to_string(), index);
        if let Some(id) = native {
            self.by_native.insert(id, index);
        }
        debug!("Registered type {} ({:?})", name, policy);
        index
    }

    fn insert_method(&mut self, type_index: usize, method: &str, func: NativeFn) -> FunctionId {
        let id = self.next_function_id;
        self.next_function_id += 1;

        let descriptor = &mut self.types[type_index];
        if let Some(previous) = descriptor.methods.insert(method.to_string(), id) {
            warn!(
                "Method {}.{} re-registered, replacing function {}",
                descriptor.name, method, previous
            );
        }
        self.functions.insert(
            id,
            FunctionEntry {
                qualified_name: format!("{}.{}", descriptor.name, method),
                func,
            },
        );
        id
    }
}

fn wrong_receiver(type_name: &str, method: &str) -> LiveObjError {
    LiveObjError::invalid_params(format!(
        "{}.{} called on a receiver of another type",
        type_name, method
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RootFunction;
    use crate::value::Instance;

    struct Thing {
        size: u32,
    }

    impl RemoteObject for Thing {
        fn properties(&self) -> Properties {
            Properties::from([("size".to_string(), Value::from(self.size))])
        }
    }

    #[test]
    fn test_builtin_root_functions() {
        let registry = Registry::new();
        let root = registry.descriptor("Root").unwrap();
        assert_eq!(root.method("getType"), Some(RootFunction::GET_TYPE));
        assert_eq!(root.method("getObject"), Some(RootFunction::GET_OBJECT));
        assert_eq!(root.method("pingObjects"), Some(RootFunction::PING_OBJECTS));
        assert_eq!(root.method("listen"), Some(RootFunction::LISTEN));
        assert_eq!(root.method("unlisten"), Some(RootFunction::UNLISTEN));
        assert_eq!(registry.function_name(1), Some("Root.getType"));
    }

    #[test]
    fn test_builtin_value_types() {
        let registry = Registry::new();
        let date = registry.descriptor("Date").unwrap();
        assert_eq!(date.policy, ReferencePolicy::Value);
        assert!(date.has_hooks());
        assert!(registry.descriptor_of::<Timestamp>().is_some());
        assert!(registry.descriptor("Map").unwrap().has_hooks());
    }

    #[test]
    fn test_duplicate_type_rejected() {
        let mut registry = Registry::new();
        registry
            .register_type::<Thing>("Thing", ReferencePolicy::RefWithSnapshot)
            .unwrap();

        match registry.register_type::<Thing>("Other", ReferencePolicy::Value) {
            Err(LiveObjError::TypeAlreadyRegistered { name }) => assert_eq!(name, "Thing"),
            other => panic!("Expected TypeAlreadyRegistered, got {:?}", other),
        }
        assert!(registry
            .register_dynamic_type("Thing", ReferencePolicy::Value)
            .is_err());
        assert!(registry
            .register_dynamic_type("Buffer", ReferencePolicy::Value)
            .is_err());
    }

    #[test]
    fn test_method_auto_registers_type() {
        let mut registry = Registry::new();
        let id = registry
            .register_method::<Thing, _>("grow", |t, args| {
                Ok(Value::from(t.size as i64 + args.i64(0)?))
            })
            .unwrap();

        let desc = registry.descriptor("Thing").unwrap();
        assert_eq!(desc.policy, ReferencePolicy::RefWithSnapshot);
        assert_eq!(desc.method("grow"), Some(id));
        assert!(registry.function(id).is_some());
        assert_eq!(registry.function_name(id), Some("Thing.grow"));
    }

    #[test]
    fn test_descriptor_for_dynamic_and_native() {
        let mut registry = Registry::new();
        registry
            .register_dynamic_type("Person", ReferencePolicy::RefWithSnapshot)
            .unwrap();
        registry
            .register_type::<Thing>("Thing", ReferencePolicy::Value)
            .unwrap();

        let person = Object::new(Instance::new("Person"));
        let thing = Object::new(Thing { size: 1 });
        let stray = Object::new(Instance::new("Nope"));

        assert_eq!(registry.descriptor_for(&person).unwrap().name, "Person");
        assert_eq!(registry.descriptor_for(&thing).unwrap().name, "Thing");
        assert!(registry.descriptor_for(&stray).is_none());
    }

    #[test]
    fn test_client_method_validated() {
        let mut registry = Registry::new();
        registry
            .register_dynamic_type("Thing", ReferencePolicy::RefWithSnapshot)
            .unwrap();

        registry
            .register_dynamic_client_method("Thing", "area", &["scale"], "this.size * this.size * scale")
            .unwrap();
        assert!(registry
            .register_dynamic_client_method("Thing", "broken", &[], "this.size +")
            .is_err());
        assert!(registry
            .register_dynamic_client_method("Nope", "x", &[], "1")
            .is_err());

        let info = registry.describe("Thing").unwrap();
        assert_eq!(info.client_methods["area"].args, vec!["scale".to_string()]);
        assert!(!info.client_methods.contains_key("broken"));
    }

    #[test]
    fn test_typed_hooks_require_registration() {
        let mut registry = Registry::new();
        match registry.register_factory::<Thing, _>(|_| Ok(Thing { size: 0 })) {
            Err(LiveObjError::UnregisteredType { .. }) => {}
            other => panic!("Expected UnregisteredType, got {:?}", other),
        }

        registry
            .register_type::<Thing>("Thing", ReferencePolicy::Value)
            .unwrap();
        registry
            .register_factory::<Thing, _>(|snapshot| {
                let size = snapshot.get("size").and_then(Value::as_u64).unwrap_or(0);
                Ok(Thing { size: size as u32 })
            })
            .unwrap();
        registry
            .register_client_method::<Thing>("double", &[], "this.size * 2")
            .unwrap();

        let desc = registry.descriptor("Thing").unwrap();
        assert!(desc.factory.is_some());
        assert!(desc.client_methods.contains_key("double"));
    }

    #[test]
    fn test_register_function_lands_on_root() {
        let mut registry = Registry::new();
        let id = registry
            .register_function("sum", |args| Ok(Value::from(args.f64(0)? + args.f64(1)?)))
            .unwrap();
        assert_eq!(registry.descriptor("Root").unwrap().method("sum"), Some(id));
        assert!(id > RootFunction::UNLISTEN);
    }
}
