//! Local stand-ins for server objects.

use std::sync::{Arc, RwLock, Weak};

use super::session::Session;
use super::types::LocalType;
use crate::error::{LiveObjError, Result};
use crate::protocol::ObjectId;
use crate::value::{Object, Properties, RemoteObject, Value};

/// Proxy of a tracked server object.
///
/// A session keeps at most one proxy per object id, so receiving the same
/// object twice yields the same `Arc` with refreshed properties. Methods are
/// forwarded through the session that created the proxy.
pub struct RemoteProxy {
    id: ObjectId,
    ty: Arc<LocalType>,
    properties: RwLock<Properties>,
    session: Weak<Session>,
}

impl RemoteProxy {
    pub(crate) fn new(id: ObjectId, ty: Arc<LocalType>, session: Weak<Session>) -> Self {
        Self {
            id,
            ty,
            properties: RwLock::new(Properties::new()),
            session,
        }
    }

    /// The proxy inside a decoded value, if it is one.
    pub fn from_value(value: &Value) -> Option<Arc<RemoteProxy>> {
        value.as_object().and_then(Object::downcast::<RemoteProxy>)
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn local_type(&self) -> &LocalType {
        &self.ty
    }

    /// Last snapshot value of a property.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.read().get(key).cloned()
    }

    pub fn snapshot(&self) -> Properties {
        self.read().clone()
    }

    /// Invoke a server method on this object. Methods the type evaluates
    /// client-side run locally instead.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let Some(function_id) = self.ty.method(method) else {
            if self.ty.client_method(method).is_some() {
                return self.call_local(method, &args);
            }
            return Err(LiveObjError::invalid_params(format!(
                "{} has no method {}",
                self.ty.name(),
                method
            )));
        };
        let session = self.session.upgrade().ok_or(LiveObjError::Disconnected)?;
        let debug = format!("{}.{}", self.ty.name(), method);
        session
            .invoke(function_id, crate::codec::bare_ref(self.id), &args, &debug)
            .await
    }

    /// Evaluate a client-executable method against the current snapshot.
    pub fn call_local(&self, method: &str, args: &[Value]) -> Result<Value> {
        let method_def = self.ty.client_method(method).ok_or_else(|| {
            LiveObjError::invalid_params(format!(
                "{} has no client method {}",
                self.ty.name(),
                method
            ))
        })?;
        method_def.eval(&self.read(), args)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Properties> {
        self.properties.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl RemoteObject for RemoteProxy {
    fn properties(&self) -> Properties {
        self.snapshot()
    }

    fn assign(&self, properties: Properties) -> Result<()> {
        *self.properties.write().unwrap_or_else(|e| e.into_inner()) = properties;
        Ok(())
    }

    fn type_name(&self) -> Option<&str> {
        Some(self.ty.name())
    }
}

impl std::fmt::Debug for RemoteProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProxy")
            .field("id", &self.id)
            .field("type", &self.ty.name())
            .finish()
    }
}
