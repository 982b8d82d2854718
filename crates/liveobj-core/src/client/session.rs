//! One live client connection: call correlation, the proxy cache, event
//! dispatch and liveness pings.
//!
//! The reader task never decodes call results itself. A result is handed
//! raw to the task awaiting it, which decodes it and may issue `getType`
//! calls of its own while the reader keeps delivering frames.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use bytes::Bytes;
use serde_json::Value as Json;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, warn};

use super::proxy::RemoteProxy;
use super::types::{HookLibrary, LocalType};
use crate::binary::{BinaryReassembly, Outbox};
use crate::cancel::CancellationToken;
use crate::codec::{bare_ref, buffer_refs, Decoder, Encoder, Materialized, ObjectSpace, OutgoingRef};
use crate::config::{ClientOptions, ProtocolConfig};
use crate::error::{LiveObjError, Result};
use crate::protocol::{
    BufferId, CallId, Command, EventCommand, FunctionId, InvokeCommand, ObjectId, ResultCommand,
    RootFunction, TypeInfo,
};
use crate::registry::TypeShape;
use crate::transport::Frame;
use crate::value::{Instance, Object, Properties, Value};

/// Handle returned by `listen`, used to remove that one listener.
pub type ListenerId = u64;

pub(crate) type EventListener = Arc<dyn Fn(&RemoteProxy, &[Value]) + Send + Sync>;

const ROOT: ObjectId = ProtocolConfig::ROOT_OBJECT_ID;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Outcome of a server-side subscribe, shared with listeners that arrive
/// while it is in flight.
type Subscribing = watch::Receiver<Option<std::result::Result<(), String>>>;

/// Listeners for one event. `subscribing` is set while the first listener's
/// `listen` call is outstanding.
#[derive(Default)]
struct EventSlot {
    listeners: Vec<(ListenerId, EventListener)>,
    subscribing: Option<Subscribing>,
}

/// A proxy pinned by the application, with its event listeners.
struct Tracked {
    proxy: Arc<RemoteProxy>,
    listeners: HashMap<String, EventSlot>,
}

enum JoinListen {
    Subscribed,
    Wait(Subscribing),
    Subscribe(watch::Sender<Option<std::result::Result<(), String>>>, Subscribing),
}

impl Tracked {
    fn new(proxy: Arc<RemoteProxy>) -> Self {
        Self {
            proxy,
            listeners: HashMap::new(),
        }
    }
}

pub(crate) struct Session {
    me: Weak<Session>,
    outbox: Outbox,
    options: ClientOptions,
    hooks: Arc<HookLibrary>,
    next_call: AtomicU64,
    pending: Mutex<HashMap<CallId, oneshot::Sender<ResultCommand>>>,
    binary: Mutex<BinaryReassembly>,
    types: RwLock<HashMap<String, Arc<LocalType>>>,
    proxies: Mutex<HashMap<ObjectId, Weak<RemoteProxy>>>,
    tracked: Mutex<HashMap<ObjectId, Tracked>>,
    next_listener: AtomicU64,
    closed: CancellationToken,
}

impl Session {
    pub(crate) fn new(
        outgoing: mpsc::UnboundedSender<Frame>,
        options: ClientOptions,
        hooks: Arc<HookLibrary>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            outbox: Outbox::new(outgoing),
            options,
            hooks,
            next_call: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            binary: Mutex::new(BinaryReassembly::new()),
            types: RwLock::new(HashMap::new()),
            proxies: Mutex::new(HashMap::new()),
            tracked: Mutex::new(HashMap::new()),
            next_listener: AtomicU64::new(1),
            closed: CancellationToken::new(),
        })
    }

    // ========================================================================
    // Reader
    // ========================================================================

    /// Read frames until the channel closes or the session is closed.
    pub(crate) async fn run(self: Arc<Self>, mut incoming: mpsc::UnboundedReceiver<Frame>) {
        loop {
            let frame = tokio::select! {
                frame = incoming.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
                _ = self.closed.cancelled() => break,
            };

            match frame {
                Frame::Text(text) => self.handle_text(&text),
                Frame::Binary(payload) => match lock(&self.binary).accept(payload) {
                    Ok(id) => debug!("received buffer {}", id),
                    Err(e) => error!("{}", e),
                },
            }
        }
        self.close();
        debug!("session reader stopped");
    }

    /// Fail every pending call with `Disconnected` and stop the reader.
    pub(crate) fn close(&self) {
        self.closed.cancel();
        lock(&self.pending).clear();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn handle_text(&self, text: &str) {
        let command = match Command::parse(text) {
            Ok(command) => command,
            Err(e) => {
                warn!("dropping unreadable frame: {}", e);
                return;
            }
        };

        match command {
            Command::Result(result) => self.handle_result(result),
            Command::Event(event) => self.handle_event(event),
            Command::Buffer(header) => {
                if let Err(e) = lock(&self.binary).announce(header) {
                    error!("{}", e);
                }
            }
            Command::Alive(alive) => self.handle_alive(alive.alive_ids),
            Command::Invoke(cmd) => {
                warn!("server invoked function {} on the client", cmd.function_id);
                let err = LiveObjError::UnknownFunction {
                    id: cmd.function_id,
                };
                let reply = Command::Result(ResultCommand::failure(cmd.call_id, err.status_message()));
                if let Err(e) = self.outbox.send_command(&reply, Vec::new()) {
                    warn!("failed to reject call {}: {}", cmd.call_id, e);
                }
            }
        }
    }

    fn handle_result(&self, result: ResultCommand) {
        let waiter = lock(&self.pending).remove(&result.call_id);
        let unclaimed = match waiter {
            Some(tx) => match tx.send(result) {
                Ok(()) => return,
                // the caller gave up meanwhile
                Err(result) => result,
            },
            None => {
                warn!(
                    "{}",
                    LiveObjError::OrphanResult {
                        call_id: result.call_id
                    }
                );
                result
            }
        };
        lock(&self.binary).discard(&buffer_refs([&unclaimed.result]));
    }

    fn handle_event(&self, event: EventCommand) {
        match self.try_decode(|d| d.decode_all(&event.args)) {
            Ok(args) => self.dispatch(event.source_object_id, &event.event_name, &args),
            Err(e) if e.is_recoverable() => {
                // needs a getType round trip, which this task must not wait on
                let Some(session) = self.me.upgrade() else {
                    return;
                };
                tokio::spawn(async move {
                    let decoded = session
                        .decode_retrying(&event.args, |d| d.decode_all(&event.args))
                        .await;
                    match decoded {
                        Ok(args) => session.dispatch(event.source_object_id, &event.event_name, &args),
                        Err(e) => error!("dropping event {:?}: {}", event.event_name, e),
                    }
                });
            }
            Err(e) => {
                lock(&self.binary).discard(&buffer_refs(&event.args));
                error!("dropping event {:?}: {}", event.event_name, e)
            }
        }
    }

    fn dispatch(&self, source: ObjectId, event: &str, args: &[Value]) {
        let (proxy, listeners) = {
            let tracked = lock(&self.tracked);
            let Some(entry) = tracked.get(&source) else {
                debug!("event {:?} for untracked object {}", event, source);
                return;
            };
            let listeners: Vec<EventListener> = entry
                .listeners
                .get(event)
                .map(|slot| slot.listeners.iter().map(|(_, f)| f.clone()).collect())
                .unwrap_or_default();
            (entry.proxy.clone(), listeners)
        };

        for listener in listeners {
            if std::panic::catch_unwind(AssertUnwindSafe(|| listener(&proxy, args))).is_err() {
                error!("listener for {:?} on object {} panicked", event, source);
            }
        }
    }

    fn handle_alive(&self, alive_ids: Vec<ObjectId>) {
        let alive: HashSet<ObjectId> = alive_ids.into_iter().collect();
        lock(&self.proxies).retain(|id, proxy| alive.contains(id) && proxy.strong_count() > 0);
        lock(&self.tracked).retain(|id, _| {
            let keep = alive.contains(id);
            if !keep {
                debug!("object {} was collected by the server", id);
            }
            keep
        });
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Encode the arguments, invoke `function_id` and decode the result.
    pub(crate) async fn invoke(
        &self,
        function_id: FunctionId,
        this_arg: Json,
        args: &[Value],
        debug_info: &str,
    ) -> Result<Value> {
        let (encoded, transfers) = {
            let space = ClientSpace::encoding(self);
            let mut encoder = Encoder::new(&space, self.outbox.buffer_ids());
            let encoded = encoder.encode_all(args)?;
            (encoded, encoder.finish())
        };
        let result = self
            .invoke_raw(function_id, this_arg, encoded, transfers, debug_info)
            .await?;
        self.decode_retrying(std::slice::from_ref(&result), |d| d.decode(&result))
            .await
    }

    /// Send an `invoke` and wait for its raw result payload.
    pub(crate) async fn invoke_raw(
        &self,
        function_id: FunctionId,
        this_arg: Json,
        args: Vec<Json>,
        transfers: Vec<(BufferId, Bytes)>,
        debug_info: &str,
    ) -> Result<Json> {
        let call_id = self.next_call.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(call_id, tx);
        if self.is_closed() {
            lock(&self.pending).remove(&call_id);
            return Err(LiveObjError::Disconnected);
        }

        let command = Command::Invoke(InvokeCommand {
            function_id,
            call_id,
            this_arg,
            args,
            debug_info: self.options.debug_mode.then(|| debug_info.to_string()),
        });
        if let Err(e) = self.outbox.send_command(&command, transfers) {
            lock(&self.pending).remove(&call_id);
            return Err(e);
        }

        let reply = match self.options.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    lock(&self.pending).remove(&call_id);
                    return Err(LiveObjError::Timeout(limit));
                }
            },
            None => rx.await,
        };
        let reply = reply.map_err(|_| LiveObjError::Disconnected)?;

        if reply.is_success() {
            Ok(reply.result)
        } else {
            Err(LiveObjError::Remote {
                message: reply.message.unwrap_or_default(),
            })
        }
    }

    /// Decode `payload`, fetching each unknown type once and starting over.
    /// When decoding finally fails, the buffers `payload` referenced are
    /// released.
    pub(crate) async fn decode_retrying<T>(
        &self,
        payload: &[Json],
        decode: impl Fn(&mut Decoder<'_, ClientSpace<'_>>) -> Result<T>,
    ) -> Result<T> {
        let decoded = self.decode_fetching(decode).await;
        if decoded.is_err() {
            lock(&self.binary).discard(&buffer_refs(payload));
        }
        decoded
    }

    async fn decode_fetching<T>(
        &self,
        decode: impl Fn(&mut Decoder<'_, ClientSpace<'_>>) -> Result<T>,
    ) -> Result<T> {
        let mut fetched = HashSet::new();
        loop {
            match self.try_decode(&decode) {
                Err(LiveObjError::UnknownType { name }) => {
                    if !fetched.insert(name.clone()) {
                        return Err(LiveObjError::UnknownType { name });
                    }
                    self.fetch_type(&name).await?;
                }
                other => return other,
            }
        }
    }

    fn try_decode<T>(
        &self,
        decode: impl Fn(&mut Decoder<'_, ClientSpace<'_>>) -> Result<T>,
    ) -> Result<T> {
        let mut binary = lock(&self.binary);
        let (value, consumed) = {
            let space = ClientSpace::decoding(self, &binary);
            let mut decoder = Decoder::new(&space);
            let value = decode(&mut decoder)?;
            (value, decoder.finish()?)
        };
        for id in consumed {
            binary.take(id);
        }
        Ok(value)
    }

    async fn fetch_type(&self, name: &str) -> Result<()> {
        debug!("fetching description of type {}", name);
        let json = self
            .invoke_raw(
                RootFunction::GET_TYPE,
                bare_ref(ROOT),
                vec![Json::from(name)],
                Vec::new(),
                "Root.getType",
            )
            .await?;
        let info: TypeInfo = serde_json::from_value(json)?;
        let ty = LocalType::from_info(info)?;
        self.types
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(ty.name().to_string(), Arc::new(ty));
        Ok(())
    }

    fn type_named(&self, name: &str) -> Option<Arc<LocalType>> {
        self.types
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    // ========================================================================
    // Root helpers
    // ========================================================================

    pub(crate) async fn get_object(&self, name_or_id: Value) -> Result<Arc<RemoteProxy>> {
        let object = self
            .invoke(RootFunction::GET_OBJECT, bare_ref(ROOT), &[name_or_id], "Root.getObject")
            .await?;
        RemoteProxy::from_value(&object)
            .ok_or_else(|| LiveObjError::protocol("getObject returned a value that is not a remote object"))
    }

    /// The root proxy; the first call every session makes.
    pub(crate) async fn fetch_root(&self) -> Result<Arc<RemoteProxy>> {
        self.get_object(Value::from(ROOT)).await
    }

    /// Re-read an object's snapshot into its proxy.
    pub(crate) async fn refresh(&self, proxy: &Arc<RemoteProxy>) -> Result<()> {
        self.ensure_known(proxy, "refresh")?;
        self.get_object(Value::from(proxy.id())).await.map(|_| ())
    }

    pub(crate) fn send_binary(&self, bytes: Bytes) -> Result<BufferId> {
        self.outbox.send_binary(bytes)
    }

    pub(crate) fn take_buffer(&self, id: BufferId) -> Option<Bytes> {
        lock(&self.binary).take(id)
    }

    /// Ping the server with every held id until the session closes.
    pub(crate) async fn ping_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.options.ping_interval);
        // the first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.closed.cancelled() => break,
            }

            let ids = self.held_ids();
            if ids.is_empty() {
                continue;
            }
            let pinged = self
                .invoke_raw(
                    RootFunction::PING_OBJECTS,
                    bare_ref(ROOT),
                    vec![Json::from(ids)],
                    Vec::new(),
                    "Root.pingObjects",
                )
                .await;
            match pinged {
                Ok(Json::Array(gone)) if !gone.is_empty() => {
                    debug!("server no longer knows objects {:?}", gone)
                }
                Ok(_) => {}
                Err(e) => debug!("ping failed: {}", e),
            }
        }
    }

    fn held_ids(&self) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = {
            let mut proxies = lock(&self.proxies);
            proxies.retain(|_, proxy| proxy.strong_count() > 0);
            proxies.keys().copied().collect()
        };
        ids.extend(lock(&self.tracked).keys().copied());
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    // ========================================================================
    // Tracking and listeners
    // ========================================================================

    fn ensure_known(&self, proxy: &Arc<RemoteProxy>, action: &'static str) -> Result<()> {
        let known = lock(&self.proxies)
            .get(&proxy.id())
            .and_then(Weak::upgrade)
            .is_some_and(|cached| Arc::ptr_eq(&cached, proxy));
        if known {
            Ok(())
        } else {
            Err(LiveObjError::UnknownObject { action })
        }
    }

    pub(crate) fn track(&self, proxy: &Arc<RemoteProxy>) -> Result<()> {
        self.ensure_known(proxy, "track")?;
        lock(&self.tracked)
            .entry(proxy.id())
            .or_insert_with(|| Tracked::new(proxy.clone()));
        Ok(())
    }

    pub(crate) async fn untrack(&self, proxy: &Arc<RemoteProxy>) -> Result<()> {
        self.unlisten_all(proxy).await?;
        lock(&self.tracked).remove(&proxy.id());
        Ok(())
    }

    pub(crate) fn is_tracked(&self, id: ObjectId) -> bool {
        lock(&self.tracked).contains_key(&id)
    }

    /// Add a listener. Only the first listener for an event subscribes on
    /// the server. Listeners added while that is in flight wait for the same
    /// outcome; on failure all of them are removed again.
    pub(crate) async fn listen(
        &self,
        proxy: &Arc<RemoteProxy>,
        event: &str,
        listener: EventListener,
    ) -> Result<ListenerId> {
        self.ensure_known(proxy, "track")?;
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        {
            let mut tracked = lock(&self.tracked);
            let entry = tracked
                .entry(proxy.id())
                .or_insert_with(|| Tracked::new(proxy.clone()));
            let slot = entry.listeners.entry(event.to_string()).or_default();
            slot.listeners.push((id, listener));
        }

        loop {
            let Some(step) = self.join_listen(proxy.id(), event, id) else {
                // removed by a concurrent unlisten before the outcome arrived
                return Ok(id);
            };
            match step {
                JoinListen::Subscribed => return Ok(id),
                JoinListen::Wait(mut outcome) => {
                    let seen = outcome.wait_for(Option::is_some).await.map(|o| o.clone());
                    match seen {
                        Ok(Some(Ok(()))) => return Ok(id),
                        Ok(Some(Err(message))) => return Err(LiveObjError::Remote { message }),
                        // the subscribing call was abandoned; look again
                        Ok(None) | Err(_) => continue,
                    }
                }
                JoinListen::Subscribe(done, mine) => {
                    let result = self.subscription(RootFunction::LISTEN, proxy, event).await;
                    self.finish_listen(proxy.id(), event, &mine, result.is_ok());
                    done.send_replace(Some(result.as_ref().map(|_| ()).map_err(|e| e.to_string())));
                    return result.map(|_| id);
                }
            }
        }
    }

    /// Decide what listener `id` does next: nothing, wait on a subscribe in
    /// flight, or subscribe itself. `None` when it is no longer registered.
    fn join_listen(&self, object: ObjectId, event: &str, id: ListenerId) -> Option<JoinListen> {
        let mut tracked = lock(&self.tracked);
        let slot = tracked.get_mut(&object)?.listeners.get_mut(event)?;
        if !slot.listeners.iter().any(|(listener, _)| *listener == id) {
            return None;
        }
        match &slot.subscribing {
            Some(outcome) if outcome.has_changed().is_ok() => Some(JoinListen::Wait(outcome.clone())),
            None if slot.listeners.len() > 1 => Some(JoinListen::Subscribed),
            _ => {
                let (done, outcome) = watch::channel(None);
                slot.subscribing = Some(outcome.clone());
                Some(JoinListen::Subscribe(done, outcome))
            }
        }
    }

    /// Settle the subscribe started with `mine`. A failed subscribe takes
    /// every listener that waited on it along.
    fn finish_listen(&self, object: ObjectId, event: &str, mine: &Subscribing, subscribed: bool) {
        let mut tracked = lock(&self.tracked);
        let Some(entry) = tracked.get_mut(&object) else {
            return;
        };
        let Some(slot) = entry.listeners.get_mut(event) else {
            return;
        };
        if !slot.subscribing.as_ref().is_some_and(|s| s.same_channel(mine)) {
            return;
        }
        if subscribed {
            slot.subscribing = None;
        } else {
            entry.listeners.remove(event);
        }
    }

    pub(crate) async fn unlisten(
        &self,
        proxy: &Arc<RemoteProxy>,
        event: &str,
        listener: Option<ListenerId>,
    ) -> Result<()> {
        if self.remove_listeners(proxy.id(), event, listener) {
            self.subscription(RootFunction::UNLISTEN, proxy, event).await?;
        }
        Ok(())
    }

    pub(crate) async fn unlisten_all(&self, proxy: &Arc<RemoteProxy>) -> Result<()> {
        let events: Vec<String> = lock(&self.tracked)
            .get_mut(&proxy.id())
            .map(|entry| entry.listeners.drain().map(|(event, _)| event).collect())
            .unwrap_or_default();
        for event in events {
            self.subscription(RootFunction::UNLISTEN, proxy, &event).await?;
        }
        Ok(())
    }

    /// Remove one listener (or all of them for the event). True when the
    /// event lost its last listener.
    fn remove_listeners(&self, object: ObjectId, event: &str, which: Option<ListenerId>) -> bool {
        let mut tracked = lock(&self.tracked);
        let Some(entry) = tracked.get_mut(&object) else {
            return false;
        };
        let Some(slot) = entry.listeners.get_mut(event) else {
            return false;
        };
        let list = &mut slot.listeners;
        let before = list.len();
        match which {
            Some(id) => list.retain(|(listener, _)| *listener != id),
            None => list.clear(),
        }
        let emptied = before > 0 && list.is_empty();
        if list.is_empty() {
            entry.listeners.remove(event);
        }
        emptied
    }

    async fn subscription(
        &self,
        function: FunctionId,
        proxy: &Arc<RemoteProxy>,
        event: &str,
    ) -> Result<()> {
        let debug_info = if function == RootFunction::LISTEN {
            "Root.listen"
        } else {
            "Root.unlisten"
        };
        let args = [Value::Object(Object::from_arc(proxy.clone())), Value::from(event)];
        self.invoke(function, bare_ref(ROOT), &args, debug_info)
            .await
            .map(|_| ())
    }
}

// ============================================================================
// Object space
// ============================================================================

/// The client's view for the codec: objects with ids are proxies, and
/// types are whatever `getType` has described so far.
pub(crate) struct ClientSpace<'a> {
    session: &'a Session,
    buffers: Option<&'a BinaryReassembly>,
}

impl<'a> ClientSpace<'a> {
    fn encoding(session: &'a Session) -> Self {
        Self {
            session,
            buffers: None,
        }
    }

    fn decoding(session: &'a Session, buffers: &'a BinaryReassembly) -> Self {
        Self {
            session,
            buffers: Some(buffers),
        }
    }
}

impl ObjectSpace for ClientSpace<'_> {
    fn shape_of(&self, object: &Object) -> Result<TypeShape> {
        let hooks = &self.session.hooks;
        if let Some(proxy) = object.downcast_ref::<RemoteProxy>() {
            return Ok(proxy.local_type().shape(hooks));
        }
        if let Some(shape) = hooks
            .name_of(object.native_type())
            .and_then(|name| hooks.value_shape(name))
        {
            return Ok(shape);
        }
        if let Some(ty) = object.type_name().and_then(|name| self.session.type_named(name)) {
            return Ok(ty.shape(hooks));
        }
        Err(LiveObjError::UnregisteredType {
            type_name: object
                .type_name()
                .unwrap_or_else(|| object.native_type_name())
                .to_string(),
        })
    }

    fn shape_named(&self, name: &str) -> Result<TypeShape> {
        if let Some(ty) = self.session.type_named(name) {
            return Ok(ty.shape(&self.session.hooks));
        }
        self.session
            .hooks
            .value_shape(name)
            .ok_or_else(|| LiveObjError::UnknownType {
                name: name.to_string(),
            })
    }

    fn reference_for(&self, object: &Object, shape: &TypeShape) -> Result<Option<OutgoingRef>> {
        if let Some(proxy) = object.downcast_ref::<RemoteProxy>() {
            return Ok(Some(OutgoingRef::Bare(proxy.id())));
        }
        if shape.policy.is_tracked() {
            return Err(LiveObjError::invalid_params(format!(
                "{} objects can only be created by the server",
                shape.name
            )));
        }
        Ok(None)
    }

    fn resolve(&self, id: ObjectId) -> Result<Object> {
        lock(&self.session.proxies)
            .get(&id)
            .and_then(Weak::upgrade)
            .map(Object::from_arc)
            .ok_or(LiveObjError::UnknownReference { id })
    }

    fn materialize(&self, id: ObjectId, shape: &TypeShape) -> Result<Materialized> {
        let mut proxies = lock(&self.session.proxies);
        if let Some(proxy) = proxies.get(&id).and_then(Weak::upgrade) {
            return Ok(Materialized::Mirror(Object::from_arc(proxy)));
        }
        let ty = self
            .session
            .type_named(&shape.name)
            .ok_or_else(|| LiveObjError::UnknownType {
                name: shape.name.clone(),
            })?;
        let proxy = Arc::new(RemoteProxy::new(id, ty, self.session.me.clone()));
        proxies.insert(id, Arc::downgrade(&proxy));
        Ok(Materialized::Mirror(Object::from_arc(proxy)))
    }

    fn construct(&self, shape: &TypeShape, snapshot: Properties) -> Result<Object> {
        Ok(Object::new(Instance::with_properties(shape.name.clone(), snapshot)))
    }

    fn buffer(&self, id: BufferId) -> Option<Bytes> {
        self.buffers.and_then(|b| b.get(id))
    }
}
