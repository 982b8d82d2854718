//! Event subscriptions and fan-out.
//!
//! Subscriber sets live on the directory records; this module adds the
//! delivery side. Event arguments are encoded once per receiving connection
//! because buffer ids are allocated per connection.

use tracing::{debug, warn};

use super::{Server, ServerSpace};
use crate::codec::Encoder;
use crate::directory::AgentId;
use crate::error::{LiveObjError, Result};
use crate::protocol::{Command, EventCommand, ObjectId};
use crate::value::{Object, Value};

pub(super) fn subscribe(
    server: &Server,
    object: &Object,
    event: &str,
    agent: AgentId,
) -> Result<ObjectId> {
    let directory = server.directory();
    let id = directory
        .id_of(object)
        .ok_or(LiveObjError::UnknownObject { action: "listen to" })?;
    directory.subscribe(id, event, agent)?;
    debug!("[agent {}] listening to {:?} on object {}", agent, event, id);
    Ok(id)
}

pub(super) fn unsubscribe(server: &Server, object: &Object, event: &str, agent: AgentId) -> bool {
    let directory = server.directory();
    let Some(id) = directory.id_of(object) else {
        return false;
    };
    let removed = directory.unsubscribe(id, event, agent);
    if removed {
        debug!("[agent {}] stopped listening to {:?} on object {}", agent, event, id);
    }
    removed
}

pub(super) fn fire(server: &Server, object: &Object, event: &str, args: &[Value]) -> Result<usize> {
    // objects that never crossed the channel have no subscribers
    let Some(id) = server.directory().id_of(object) else {
        return Ok(0);
    };

    let _gate = server.reply_gate();
    let mut delivered = 0;
    for agent in server.directory().subscribers(id, event) {
        let Some(outbox) = server.outbox(agent) else {
            continue;
        };

        let space = ServerSpace::encoding(&server.shared);
        let mut encoder = Encoder::new(&space, outbox.buffer_ids());
        let encoded = encoder.encode_all(args)?;
        let command = Command::Event(EventCommand {
            source_object_id: id,
            event_name: event.to_string(),
            args: encoded,
        });

        match outbox.send_command(&command, encoder.finish()) {
            Ok(()) => delivered += 1,
            Err(e) => warn!("[agent {}] failed to deliver {:?}: {}", agent, event, e),
        }
    }
    Ok(delivered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerOptions;
    use crate::registry::{ReferencePolicy, Registry};
    use crate::transport::{memory_pair, Frame};
    use crate::value::Instance;

    #[tokio::test]
    async fn test_fire_reaches_only_subscribers() {
        let mut registry = Registry::new();
        registry
            .register_dynamic_type("Thing", ReferencePolicy::RefWithSnapshot)
            .unwrap();
        let server = Server::new(registry, ServerOptions::default());

        let (mut a_local, a_remote) = memory_pair();
        let (_b_local, b_remote) = memory_pair();
        let a = server.accept(a_remote).unwrap();
        let _b = server.accept(b_remote).unwrap();

        let thing = Object::new(Instance::new("Thing"));
        assert_eq!(server.fire_event(&thing, "tick", vec![]).unwrap(), 0);

        server.directory().record_of(&thing);
        subscribe(&server, &thing, "tick", a).unwrap();
        let sent = server
            .fire_event(&thing, "tick", vec![Value::from(1)])
            .unwrap();
        assert_eq!(sent, 1);

        match a_local.incoming.recv().await.unwrap() {
            Frame::Text(text) => match Command::parse(&text).unwrap() {
                Command::Event(e) => {
                    assert_eq!(e.event_name, "tick");
                    assert_eq!(e.args, vec![serde_json::json!(1)]);
                }
                other => panic!("Expected event, got {:?}", other),
            },
            other => panic!("Expected text frame, got {:?}", other),
        }

        assert!(unsubscribe(&server, &thing, "tick", a));
        assert_eq!(server.fire_event(&thing, "tick", vec![]).unwrap(), 0);
    }

    #[test]
    fn test_subscribe_untracked_object() {
        let server = Server::new(Registry::new(), ServerOptions::default());
        let stray = Object::new(Instance::new("Thing"));
        match subscribe(&server, &stray, "tick", 1) {
            Err(LiveObjError::UnknownObject { action }) => assert_eq!(action, "listen to"),
            other => panic!("Expected UnknownObject, got {:?}", other),
        }
    }
}
