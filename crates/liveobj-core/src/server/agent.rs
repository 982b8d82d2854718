//! Per-connection session loop on the server.
//!
//! Frames are handled strictly in arrival order: a `buffer` header must be
//! followed by its binary frame, and an `invoke` is decoded (consuming any
//! buffers it references) before the next frame is looked at. Only the
//! execution of the native function runs on its own task.

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{invoke, AgentLink, Server};
use crate::binary::{BinaryReassembly, Outbox};
use crate::codec::buffer_refs;
use crate::directory::AgentId;
use crate::protocol::{Command, ResultCommand};
use crate::transport::Frame;

pub(super) async fn run(
    server: Server,
    agent: AgentId,
    link: AgentLink,
    mut incoming: mpsc::UnboundedReceiver<Frame>,
) {
    info!("[agent {}] connected", agent);

    loop {
        let frame = tokio::select! {
            frame = incoming.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = server.shared.shutdown.cancelled() => break,
        };

        match frame {
            Frame::Text(text) => {
                handle_text(&server, agent, &link.outbox, &mut link.buffers(), &text)
            }
            Frame::Binary(payload) => match link.buffers().accept(payload) {
                Ok(id) => debug!("[agent {}] received buffer {}", agent, id),
                Err(e) => error!("[agent {}] {}", agent, e),
            },
        }
    }

    server.close_agent(agent);
    info!("[agent {}] disconnected", agent);
}

fn handle_text(
    server: &Server,
    agent: AgentId,
    outbox: &Outbox,
    binary: &mut BinaryReassembly,
    text: &str,
) {
    let command = match Command::parse(text) {
        Ok(command) => command,
        Err(e) => {
            warn!("[agent {}] dropping unreadable frame: {}", agent, e);
            return;
        }
    };
    debug!("[agent {}] <- {}", agent, command.name());

    match command {
        Command::Invoke(cmd) => {
            let call_id = cmd.call_id;
            match invoke::prepare(server, binary, cmd) {
                Ok(call) => {
                    tokio::spawn(invoke::execute(server.clone(), agent, outbox.clone(), call));
                }
                Err(e) => {
                    debug!("[agent {}] call {} rejected: {}", agent, call_id, e);
                    let reply = Command::Result(ResultCommand::failure(call_id, e.status_message()));
                    if let Err(e) = outbox.send_command(&reply, Vec::new()) {
                        warn!("[agent {}] failed to send result {}: {}", agent, call_id, e);
                    }
                }
            }
        }
        Command::Buffer(header) => {
            if let Err(e) = binary.announce(header) {
                error!("[agent {}] {}", agent, e);
            }
        }
        Command::Result(result) => {
            warn!(
                "[agent {}] Call id {} not found, dropping result",
                agent, result.call_id
            );
            binary.discard(&buffer_refs([&result.result]));
        }
        other => {
            warn!(
                "[agent {}] ignoring {} command sent to the server",
                agent,
                other.name()
            );
        }
    }
}
