//! Built-in methods of the root object (function ids 1 to 5).

use futures::future::{self, FutureExt};

use super::{broker, CallContext};
use crate::error::{LiveObjError, Result};
use crate::registry::{Args, NativeFuture};
use crate::value::Value;

fn ready(result: Result<Value>) -> NativeFuture {
    future::ready(result).boxed()
}

/// `getType(name)`: wire description of a registered type.
pub(crate) fn get_type(ctx: CallContext, _this: Value, args: Args) -> NativeFuture {
    ready(args.str(0).and_then(|name| {
        let info = ctx
            .server()
            .registry()
            .describe(name)
            .ok_or_else(|| LiveObjError::UnknownType {
                name: name.to_string(),
            })?;
        Ok(Value::from_json(serde_json::to_value(info)?))
    }))
}

/// `getObject(nameOrId)`: an object registered by name, or any tracked
/// object by id.
pub(crate) fn get_object(ctx: CallContext, _this: Value, args: Args) -> NativeFuture {
    let server = ctx.server();
    let result = match args.get(0) {
        Value::String(name) => server
            .named(name)
            .map(Value::Object)
            .ok_or_else(|| LiveObjError::UnknownName { name: name.clone() }),
        other => match other.as_u64() {
            Some(id) => server
                .directory()
                .by_id(id)
                .map(Value::Object)
                .ok_or(LiveObjError::UnknownReference { id }),
            None => Err(LiveObjError::invalid_params(
                "argument 0 must be an object name or id",
            )),
        },
    };
    ready(result)
}

/// `pingObjects(ids)`: refresh liveness of every listed object. Returns the
/// ids the server no longer knows.
pub(crate) fn ping_objects(ctx: CallContext, _this: Value, args: Args) -> NativeFuture {
    let directory = ctx.server().directory();
    let result = match args.get(0).as_array() {
        Some(ids) => Ok(Value::Array(
            ids.iter()
                .filter_map(Value::as_u64)
                .filter(|id| !directory.touch(*id))
                .map(Value::from)
                .collect(),
        )),
        None => Err(LiveObjError::invalid_params(
            "argument 0 must be an array of ids",
        )),
    };
    ready(result)
}

/// `listen(object, eventName)` for the calling connection.
pub(crate) fn listen(ctx: CallContext, _this: Value, args: Args) -> NativeFuture {
    let result = args.object(0).and_then(|object| {
        let event = args.str(1)?;
        broker::subscribe(ctx.server(), object, event, ctx.agent())?;
        Ok(Value::Null)
    });
    ready(result)
}

/// `unlisten(object, eventName)` for the calling connection. Returns whether
/// a subscription was removed.
pub(crate) fn unlisten(ctx: CallContext, _this: Value, args: Args) -> NativeFuture {
    let result = args.object(0).and_then(|object| {
        let event = args.str(1)?;
        Ok(Value::Bool(broker::unsubscribe(
            ctx.server(),
            object,
            event,
            ctx.agent(),
        )))
    });
    ready(result)
}
