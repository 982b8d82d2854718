//! Invocation engine: decode an `invoke`, run the native function, reply.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use bytes::Bytes;
use futures::FutureExt;
use serde_json::Value as Json;
use tracing::{debug, warn};

use super::{CallContext, Server, ServerSpace};
use crate::binary::{BinaryReassembly, Outbox};
use crate::codec::{buffer_refs, Decoder, Encoder};
use crate::directory::AgentId;
use crate::error::{LiveObjError, Result};
use crate::protocol::{BufferId, CallId, Command, InvokeCommand, ResultCommand};
use crate::registry::{Args, NativeFn};
use crate::value::Value;

/// A decoded call, ready to run.
pub(super) struct PreparedCall {
    call_id: CallId,
    name: String,
    func: NativeFn,
    this: Value,
    args: Args,
}

/// Look up the function and decode receiver and arguments. Buffers the
/// payload referenced leave `binary` either way: moved into the call on
/// success, discarded when the call is rejected.
pub(super) fn prepare(
    server: &Server,
    binary: &mut BinaryReassembly,
    cmd: InvokeCommand,
) -> Result<PreparedCall> {
    let prepared = decode_call(server, binary, &cmd);
    if prepared.is_err() {
        binary.discard(&buffer_refs(std::iter::once(&cmd.this_arg).chain(&cmd.args)));
    }
    prepared
}

fn decode_call(
    server: &Server,
    binary: &mut BinaryReassembly,
    cmd: &InvokeCommand,
) -> Result<PreparedCall> {
    let registry = &server.shared.registry;
    let func = registry
        .function(cmd.function_id)
        .ok_or(LiveObjError::UnknownFunction {
            id: cmd.function_id,
        })?;
    let name = registry
        .function_name(cmd.function_id)
        .unwrap_or_default()
        .to_string();

    if let Some(info) = &cmd.debug_info {
        debug!("call {} to {} from {}", cmd.call_id, name, info);
    }

    let (this, args, consumed) = {
        let space = ServerSpace::decoding(&server.shared, binary);
        let mut decoder = Decoder::new(&space);
        let this = decoder.decode(&cmd.this_arg)?;
        let args = decoder.decode_all(&cmd.args)?;
        (this, args, decoder.finish()?)
    };
    for id in consumed {
        binary.take(id);
    }

    Ok(PreparedCall {
        call_id: cmd.call_id,
        name,
        func,
        this,
        args: Args::new(args),
    })
}

/// Run a prepared call and send its `result`.
pub(super) async fn execute(server: Server, agent: AgentId, outbox: Outbox, call: PreparedCall) {
    let ctx = CallContext::new(agent, server.clone());
    let call_id = call.call_id;

    let outcome = run_native(call.func, ctx, call.this, call.args).await;

    let _gate = server.reply_gate();
    let (reply, transfers) = match outcome.and_then(|value| encode(&server, &outbox, &value)) {
        Ok((json, transfers)) => (ResultCommand::success(call_id, json), transfers),
        Err(e) => {
            debug!("[agent {}] {} failed: {}", agent, call.name, e);
            (ResultCommand::failure(call_id, e.status_message()), Vec::new())
        }
    };

    if let Err(e) = outbox.send_command(&Command::Result(reply), transfers) {
        warn!("[agent {}] failed to send result {}: {}", agent, call_id, e);
    }
}

fn encode(
    server: &Server,
    outbox: &Outbox,
    value: &Value,
) -> Result<(Json, Vec<(BufferId, Bytes)>)> {
    let space = ServerSpace::encoding(&server.shared);
    let mut encoder = Encoder::new(&space, outbox.buffer_ids());
    let json = encoder.encode(value)?;
    Ok((json, encoder.finish()))
}

/// Call a native function, turning panics (while building the future or
/// while polling it) into errors.
async fn run_native(func: NativeFn, ctx: CallContext, this: Value, args: Args) -> Result<Value> {
    let future = match std::panic::catch_unwind(AssertUnwindSafe(|| func(ctx, this, args))) {
        Ok(future) => future,
        Err(panic) => return Err(panic_error(panic)),
    };
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(panic_error(panic)),
    }
}

fn panic_error(panic: Box<dyn Any + Send>) -> LiveObjError {
    let message = if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "native function panicked".to_string()
    };
    LiveObjError::NativeInvocation { message }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerOptions;
    use crate::registry::{NativeFuture, Registry};
    use std::sync::Arc;

    fn ctx() -> CallContext {
        CallContext::new(1, Server::new(Registry::new(), ServerOptions::default()))
    }

    #[tokio::test]
    async fn test_panic_becomes_error() {
        let func: NativeFn = Arc::new(|_ctx: CallContext, _this: Value, _args: Args| -> NativeFuture {
            panic!("boom")
        });
        match run_native(func, ctx(), Value::Null, Args::default()).await {
            Err(LiveObjError::NativeInvocation { message }) => assert_eq!(message, "boom"),
            other => panic!("Expected NativeInvocation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_async_panic_becomes_error() {
        let func: NativeFn = Arc::new(|_ctx: CallContext, _this: Value, args: Args| {
            async move {
                if args.is_empty() {
                    panic!("late");
                }
                Ok::<_, LiveObjError>(Value::Null)
            }
            .boxed()
        });
        match run_native(func, ctx(), Value::Null, Args::default()).await {
            Err(LiveObjError::NativeInvocation { message }) => assert_eq!(message, "late"),
            other => panic!("Expected NativeInvocation, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_function() {
        let server = Server::new(Registry::new(), ServerOptions::default());
        let mut binary = BinaryReassembly::new();
        let cmd = InvokeCommand {
            function_id: 999,
            call_id: 1,
            this_arg: Json::Null,
            args: vec![],
            debug_info: None,
        };
        match prepare(&server, &mut binary, cmd) {
            Err(LiveObjError::UnknownFunction { id }) => assert_eq!(id, 999),
            Err(other) => panic!("Expected UnknownFunction, got {:?}", other),
            Ok(_) => panic!("Expected UnknownFunction"),
        }
    }

    #[test]
    fn test_prepare_consumes_buffers() {
        let server = Server::new(Registry::new(), ServerOptions::default());
        let mut binary = BinaryReassembly::new();
        binary
            .announce(crate::protocol::BufferHeader { id: 4, length: 2 })
            .unwrap();
        binary.accept(Bytes::from_static(b"hi")).unwrap();

        let cmd = InvokeCommand {
            function_id: crate::protocol::RootFunction::PING_OBJECTS,
            call_id: 1,
            this_arg: serde_json::json!({"_byRef": 0}),
            args: vec![serde_json::json!({"_type": "Buffer", "id": 4})],
            debug_info: None,
        };
        let call = prepare(&server, &mut binary, cmd).unwrap();
        assert_eq!(call.args.get(0).as_bytes().unwrap().as_ref(), b"hi");
        assert_eq!(binary.stored(), 0);
    }

    #[test]
    fn test_rejected_call_releases_its_buffers() {
        let server = Server::new(Registry::new(), ServerOptions::default());
        let mut binary = BinaryReassembly::new();
        for (id, data) in [(4, &b"hi"[..]), (5, &b"more"[..])] {
            binary
                .announce(crate::protocol::BufferHeader {
                    id,
                    length: data.len(),
                })
                .unwrap();
            binary.accept(Bytes::copy_from_slice(data)).unwrap();
        }

        // the dangling reference fails the decode after buffer 4 was read
        let cmd = InvokeCommand {
            function_id: crate::protocol::RootFunction::PING_OBJECTS,
            call_id: 1,
            this_arg: serde_json::json!({"_byRef": 0}),
            args: vec![
                serde_json::json!({"_type": "Buffer", "id": 4}),
                serde_json::json!({"_byRef": 999}),
            ],
            debug_info: None,
        };
        match prepare(&server, &mut binary, cmd) {
            Err(LiveObjError::UnknownReference { id }) => assert_eq!(id, 999),
            Err(other) => panic!("Expected UnknownReference, got {:?}", other),
            Ok(_) => panic!("Expected UnknownReference"),
        }
        assert!(binary.get(4).is_none());

        // an unknown function releases what it referenced too
        let cmd = InvokeCommand {
            function_id: 999,
            call_id: 2,
            this_arg: serde_json::json!({"_byRef": 0}),
            args: vec![serde_json::json!([{"_type": "Buffer", "id": 5}])],
            debug_info: None,
        };
        assert!(prepare(&server, &mut binary, cmd).is_err());
        assert_eq!(binary.stored(), 0);
    }
}
