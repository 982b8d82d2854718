//! Server side: shared object graph, per-connection agents, and the GC task.
//!
//! A [`Server`] is cheap to clone; every clone drives the same directory,
//! registry and set of connected agents. Transports hand it a [`Channel`]
//! per connection through [`Server::accept`] or [`Server::serve`].

mod agent;
mod broker;
mod gc;
mod invoke;
pub(crate) mod root;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::binary::{BinaryReassembly, Outbox};
use crate::cancel::CancellationToken;
use crate::codec::{Materialized, ObjectSpace, OutgoingRef};
use crate::config::{ProtocolConfig, ServerOptions};
use crate::directory::{AgentId, ObjectDirectory};
use crate::error::{LiveObjError, Result};
use crate::protocol::{AliveCommand, BufferId, Command, ObjectId};
use crate::registry::{Registry, TypeShape};
use crate::transport::{Channel, Frame};
use crate::value::{Instance, Object, Properties, Value};

/// Writer half of a connection plus the buffers it has sent us.
#[derive(Clone)]
pub(crate) struct AgentLink {
    outbox: Outbox,
    buffers: Arc<Mutex<BinaryReassembly>>,
}

impl AgentLink {
    fn new(outbox: Outbox) -> Self {
        Self {
            outbox,
            buffers: Arc::new(Mutex::new(BinaryReassembly::new())),
        }
    }

    pub(crate) fn buffers(&self) -> MutexGuard<'_, BinaryReassembly> {
        self.buffers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub(crate) struct ServerShared {
    registry: Arc<Registry>,
    directory: ObjectDirectory,
    agents: Mutex<HashMap<AgentId, AgentLink>>,
    /// Held shared while a reply or event is encoded and queued, exclusively
    /// while a sweep runs and its `alive` list is queued. An id is therefore
    /// either touched before the sweep (and listed as alive) or sent after
    /// the `alive` that omits it.
    sweep_gate: RwLock<()>,
    names: RwLock<HashMap<String, Object>>,
    root: Arc<Instance>,
    options: ServerOptions,
    next_agent: AtomicU64,
    gc_started: AtomicBool,
    shutdown: CancellationToken,
}

/// Handle to a running object server.
#[derive(Clone)]
pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    /// Build a server around a populated registry. The root object is pinned
    /// as id 0 immediately; call [`Server::start`] to run the collector.
    pub fn new(registry: Registry, options: ServerOptions) -> Self {
        let root = Arc::new(Instance::new(ProtocolConfig::ROOT_TYPE_NAME));
        let directory = ObjectDirectory::new();
        directory.pin(&Object::from_arc(root.clone()));

        Self {
            shared: Arc::new(ServerShared {
                registry: Arc::new(registry),
                directory,
                agents: Mutex::new(HashMap::new()),
                sweep_gate: RwLock::new(()),
                names: RwLock::new(HashMap::new()),
                root,
                options,
                next_agent: AtomicU64::new(1),
                gc_started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Spawn the periodic collector. Idempotent.
    pub fn start(&self) {
        if self.shared.gc_started.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(gc::run(self.clone()));
        info!(
            "Object server started (gc every {:?}, timeout {:?})",
            self.shared.options.gc_interval, self.shared.options.gc_timeout
        );
    }

    /// Run a session for `channel` on a new task.
    pub fn accept(&self, channel: Channel) -> Result<AgentId> {
        let (agent, link) = self.open_agent(channel.outgoing)?;
        tokio::spawn(agent::run(self.clone(), agent, link, channel.incoming));
        Ok(agent)
    }

    /// Run a session for `channel` until it closes.
    pub async fn serve(&self, channel: Channel) -> Result<()> {
        let (agent, link) = self.open_agent(channel.outgoing)?;
        agent::run(self.clone(), agent, link, channel.incoming).await;
        Ok(())
    }

    fn open_agent(&self, outgoing: mpsc::UnboundedSender<Frame>) -> Result<(AgentId, AgentLink)> {
        if self.shared.shutdown.is_cancelled() {
            return Err(LiveObjError::Disconnected);
        }
        let mut agents = self.agents();
        let limit = self.shared.options.max_connections;
        if agents.len() >= limit {
            warn!("Rejecting connection: at max capacity ({})", limit);
            return Err(LiveObjError::ConnectionLimit { limit });
        }
        let agent = self.shared.next_agent.fetch_add(1, Ordering::Relaxed);
        let link = AgentLink::new(Outbox::new(outgoing));
        agents.insert(agent, link.clone());
        Ok((agent, link))
    }

    fn close_agent(&self, agent: AgentId) {
        self.agents().remove(&agent);
        self.shared.directory.remove_agent(agent);
    }

    fn agents(&self) -> MutexGuard<'_, HashMap<AgentId, AgentLink>> {
        self.shared.agents.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn outbox(&self, agent: AgentId) -> Option<Outbox> {
        self.agents().get(&agent).map(|link| link.outbox.clone())
    }

    /// Hold while encoding and queueing anything that may carry object ids.
    pub(crate) fn reply_gate(&self) -> RwLockReadGuard<'_, ()> {
        self.shared
            .sweep_gate
            .read()
            .unwrap_or_else(|e| e.into_inner())
    }

    // ========================================================================
    // Object graph
    // ========================================================================

    /// Pin `object` and make it reachable as `getObject(name)`.
    pub fn register_object(&self, object: &Object, name: &str) -> ObjectId {
        let id = self.shared.directory.pin(object);
        let previous = self
            .shared
            .names
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), object.clone());
        if let Some(previous) = previous {
            if !previous.ptr_eq(object) {
                if let Some(old) = self.shared.directory.id_of(&previous) {
                    self.shared.directory.unpin(old);
                }
            }
        }
        info!("Registered object {} as {:?}", id, name);
        id
    }

    pub fn named(&self, name: &str) -> Option<Object> {
        self.shared
            .names
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Set a property on the root object; whatever it references stays
    /// reachable for the collector.
    pub fn set_root_property(&self, key: &str, value: impl Into<Value>) {
        self.shared.root.set(key, value);
    }

    pub fn root(&self) -> Object {
        Object::from_arc(self.shared.root.clone())
    }

    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    pub fn directory(&self) -> &ObjectDirectory {
        &self.shared.directory
    }

    /// Deliver `event` on `object` to every subscribed connection. Returns
    /// the number of connections it was sent to.
    pub fn fire_event(&self, object: &Object, event: &str, args: Vec<Value>) -> Result<usize> {
        broker::fire(self, object, event, &args)
    }

    /// Run one collection now and broadcast the surviving ids.
    pub fn collect_garbage(&self) -> Vec<ObjectId> {
        let _gate = self
            .shared
            .sweep_gate
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let alive = gc::collect(&self.shared);
        self.broadcast(&Command::Alive(AliveCommand {
            alive_ids: alive.clone(),
        }));
        alive
    }

    /// Send a standalone buffer to one connection.
    pub fn send_binary(&self, agent: AgentId, bytes: Bytes) -> Result<BufferId> {
        self.outbox(agent)
            .ok_or(LiveObjError::Disconnected)?
            .send_binary(bytes)
    }

    /// Claim a standalone buffer `agent` sent with its `send_binary`.
    /// Unclaimed buffers are dropped oldest first once too many pile up.
    pub fn take_buffer(&self, agent: AgentId, id: BufferId) -> Option<Bytes> {
        let link = self.agents().get(&agent).cloned()?;
        let bytes = link.buffers().take(id);
        bytes
    }

    pub fn connection_count(&self) -> usize {
        self.agents().len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Stop the collector and close every session.
    pub fn shutdown(&self) {
        info!("Object server shutting down");
        self.shared.shutdown.cancel();
    }

    fn broadcast(&self, command: &Command) {
        let outboxes: Vec<(AgentId, Outbox)> = self
            .agents()
            .iter()
            .map(|(id, link)| (*id, link.outbox.clone()))
            .collect();
        for (agent, outbox) in outboxes {
            if let Err(e) = outbox.send_command(command, Vec::new()) {
                warn!("[agent {}] failed to send {}: {}", agent, command.name(), e);
            }
        }
    }
}

// ============================================================================
// Call context
// ============================================================================

/// Passed to every native function: which connection is calling, and the
/// server it is connected to.
#[derive(Clone)]
pub struct CallContext {
    agent: AgentId,
    server: Server,
}

impl CallContext {
    pub(crate) fn new(agent: AgentId, server: Server) -> Self {
        Self { agent, server }
    }

    pub fn agent(&self) -> AgentId {
        self.agent
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    /// Send a standalone buffer back to the caller.
    pub fn send_binary(&self, bytes: Bytes) -> Result<BufferId> {
        self.server.send_binary(self.agent, bytes)
    }

    /// Claim a buffer the caller sent ahead of this call.
    pub fn take_buffer(&self, id: BufferId) -> Option<Bytes> {
        self.server.take_buffer(self.agent, id)
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("agent", &self.agent)
            .finish()
    }
}

// ============================================================================
// Object space
// ============================================================================

/// The server's view for the codec: ids come from the directory, types
/// from the registry, and every object is owned here.
pub(crate) struct ServerSpace<'a> {
    shared: &'a ServerShared,
    buffers: Option<&'a BinaryReassembly>,
}

impl<'a> ServerSpace<'a> {
    pub(crate) fn encoding(shared: &'a ServerShared) -> Self {
        Self {
            shared,
            buffers: None,
        }
    }

    pub(crate) fn decoding(shared: &'a ServerShared, buffers: &'a BinaryReassembly) -> Self {
        Self {
            shared,
            buffers: Some(buffers),
        }
    }
}

impl ObjectSpace for ServerSpace<'_> {
    fn shape_of(&self, object: &Object) -> Result<TypeShape> {
        self.shared
            .registry
            .descriptor_for(object)
            .map(|d| d.shape())
            .ok_or_else(|| LiveObjError::UnregisteredType {
                type_name: object
                    .type_name()
                    .unwrap_or_else(|| object.native_type_name())
                    .to_string(),
            })
    }

    fn shape_named(&self, name: &str) -> Result<TypeShape> {
        self.shared
            .registry
            .descriptor(name)
            .map(|d| d.shape())
            .ok_or_else(|| LiveObjError::UnknownType {
                name: name.to_string(),
            })
    }

    fn reference_for(&self, object: &Object, shape: &TypeShape) -> Result<Option<OutgoingRef>> {
        if !shape.policy.is_tracked() {
            return Ok(None);
        }
        Ok(Some(OutgoingRef::Tagged(
            self.shared.directory.record_of(object),
        )))
    }

    fn resolve(&self, id: ObjectId) -> Result<Object> {
        self.shared
            .directory
            .by_id(id)
            .ok_or(LiveObjError::UnknownReference { id })
    }

    fn materialize(&self, id: ObjectId, _shape: &TypeShape) -> Result<Materialized> {
        self.resolve(id).map(Materialized::Owned)
    }

    fn construct(&self, shape: &TypeShape, snapshot: Properties) -> Result<Object> {
        match self
            .shared
            .registry
            .descriptor(&shape.name)
            .and_then(|d| d.factory.clone())
        {
            Some(factory) => factory(snapshot),
            None => Ok(Object::new(Instance::with_properties(
                shape.name.clone(),
                snapshot,
            ))),
        }
    }

    fn buffer(&self, id: BufferId) -> Option<Bytes> {
        self.buffers.and_then(|b| b.get(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Decoder, Encoder};
    use crate::registry::ReferencePolicy;
    use crate::transport::memory_pair;
    use serde_json::json;

    fn server() -> Server {
        let mut registry = Registry::new();
        registry
            .register_dynamic_type("Thing", ReferencePolicy::RefWithSnapshot)
            .unwrap();
        Server::new(registry, ServerOptions::default())
    }

    #[test]
    fn test_root_is_id_zero() {
        let server = server();
        assert_eq!(server.directory().id_of(&server.root()), Some(0));
    }

    #[test]
    fn test_register_object_by_name() {
        let server = server();
        let thing = Object::new(Instance::new("Thing"));
        let id = server.register_object(&thing, "testobj");
        assert!(id > 0);
        assert!(server.named("testobj").unwrap().ptr_eq(&thing));
        assert_eq!(server.directory().roots().len(), 2);
    }

    #[test]
    fn test_space_round_trip_keeps_identity() {
        let server = server();
        let thing = Object::new(Instance::new("Thing"));
        let ids = AtomicU64::new(1);

        let space = ServerSpace::encoding(&server.shared);
        let mut encoder = Encoder::new(&space, &ids);
        let wire = encoder.encode(&Value::Object(thing.clone())).unwrap();
        let id = wire["_byRef"].as_u64().unwrap();

        // the client sends it back as a bare reference
        let buffers = BinaryReassembly::new();
        let space = ServerSpace::decoding(&server.shared, &buffers);
        let mut decoder = Decoder::new(&space);
        let back = decoder.decode(&json!({"_byRef": id})).unwrap();
        assert!(back.as_object().unwrap().ptr_eq(&thing));
    }

    #[test]
    fn test_snapshot_from_client_is_ignored() {
        let server = server();
        let thing = Instance::new("Thing");
        thing.set("color", "red");
        let thing = Object::new(thing);
        let id = server.directory().record_of(&thing);

        let buffers = BinaryReassembly::new();
        let space = ServerSpace::decoding(&server.shared, &buffers);
        let mut decoder = Decoder::new(&space);
        decoder
            .decode(&json!({"_type": "Thing", "_byRef": id, "color": "blue"}))
            .unwrap();
        decoder.finish().unwrap();
        assert_eq!(thing.get("color"), Some(Value::from("red")));
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let mut registry = Registry::new();
        registry
            .register_dynamic_type("Thing", ReferencePolicy::RefWithSnapshot)
            .unwrap();
        let server = Server::new(registry, ServerOptions::default().with_max_connections(1));

        let (_a_local, a_remote) = memory_pair();
        let (_b_local, b_remote) = memory_pair();
        server.accept(a_remote).unwrap();
        match server.accept(b_remote) {
            Err(LiveObjError::ConnectionLimit { limit }) => assert_eq!(limit, 1),
            other => panic!("Expected ConnectionLimit, got {:?}", other),
        }
        assert_eq!(server.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_closed_channel_unregisters_agent() {
        let server = server();
        let (local, remote) = memory_pair();
        server.accept(remote).unwrap();
        assert_eq!(server.connection_count(), 1);

        drop(local);
        for _ in 0..50 {
            if server.connection_count() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sweep_waits_for_replies_in_flight() {
        let server = server();
        let thing = Object::new(Instance::new("Thing"));

        // a reply is being encoded: the id it hands out is not yet on the wire
        let gate = server.reply_gate();
        let id = server.directory().record_of(&thing);
        let sweeping = {
            let server = server.clone();
            tokio::task::spawn_blocking(move || server.collect_garbage())
        };
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!sweeping.is_finished());

        drop(gate);
        let alive = tokio::time::timeout(std::time::Duration::from_secs(5), sweeping)
            .await
            .unwrap()
            .unwrap();
        // touched before the sweep, so listed as alive
        assert!(alive.contains(&id));
    }
}
