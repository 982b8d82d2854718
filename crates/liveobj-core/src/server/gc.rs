//! Reachability collector.
//!
//! Each cycle walks from the pinned objects through their properties; the
//! directory then drops every record that was neither reached, pinned, nor
//! referenced within the timeout.

use std::collections::HashSet;

use tracing::debug;

use super::{Server, ServerShared};
use crate::protocol::ObjectId;
use crate::value::{Object, Value};

pub(super) fn collect(shared: &ServerShared) -> Vec<ObjectId> {
    let directory = &shared.directory;
    let before = directory.len();

    let mut reachable = HashSet::new();
    let mut seen = HashSet::new();
    let mut stack = directory.roots();

    while let Some(object) = stack.pop() {
        if !seen.insert(object.key()) {
            continue;
        }
        if let Some(id) = directory.id_of(&object) {
            reachable.insert(id);
        }
        for value in object.properties().into_values() {
            push_objects(value, &mut stack);
        }
    }

    let alive = directory.sweep(&reachable, shared.options.gc_timeout);
    debug!(
        "GC: {} reachable, {} evicted, {} alive",
        reachable.len(),
        before.saturating_sub(alive.len()),
        alive.len()
    );
    alive
}

fn push_objects(value: Value, out: &mut Vec<Object>) {
    match value {
        Value::Object(object) => out.push(object),
        Value::Array(items) => items.into_iter().for_each(|v| push_objects(v, out)),
        Value::Map(map) => map.into_values().for_each(|v| push_objects(v, out)),
        _ => {}
    }
}

/// Collector loop; stops with the server.
pub(super) async fn run(server: Server) {
    let mut interval = tokio::time::interval(server.shared.options.gc_interval);
    // the first tick completes immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                server.collect_garbage();
            }
            _ = server.shared.shutdown.cancelled() => break,
        }
    }
    debug!("GC loop stopped");
}
