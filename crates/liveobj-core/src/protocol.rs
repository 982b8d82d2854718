//! Wire commands and type descriptions.
//!
//! Every text frame is one JSON object with a `command` discriminator:
//!
//! ```text
//! {"command":"invoke","functionId":7,"callId":1,"thisArg":{"_byRef":3},"args":[1,2]}
//! {"command":"result","callId":1,"status":0,"result":3}
//! {"command":"event","sourceObjectId":3,"eventName":"tick","args":[...]}
//! {"command":"buffer","id":1,"length":1024}      (followed by one binary frame)
//! {"command":"alive","aliveIds":[0,3,5]}
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::Result;
use crate::registry::ReferencePolicy;
use crate::transport::Frame;

pub type ObjectId = u64;
pub type FunctionId = u64;
pub type CallId = u64;
pub type BufferId = u64;

/// Result status for a successful call.
pub const STATUS_OK: u8 = 0;
/// Result status for a failed call; `message` carries the reason.
pub const STATUS_ERROR: u8 = 1;

/// Function ids of the root object's built-in methods. Registered first, so
/// they are identical on every server.
pub struct RootFunction;

impl RootFunction {
    pub const GET_TYPE: FunctionId = 1;
    pub const GET_OBJECT: FunctionId = 2;
    pub const PING_OBJECTS: FunctionId = 3;
    pub const LISTEN: FunctionId = 4;
    pub const UNLISTEN: FunctionId = 5;
}

/// A protocol command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum Command {
    Invoke(InvokeCommand),
    Result(ResultCommand),
    Event(EventCommand),
    Buffer(BufferHeader),
    Alive(AliveCommand),
}

impl Command {
    /// Parse one text frame.
    pub fn parse(text: &str) -> Result<Command> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_frame(&self) -> Result<Frame> {
        Ok(Frame::Text(serde_json::to_string(self)?))
    }

    /// Command name as written on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Invoke(_) => "invoke",
            Command::Result(_) => "result",
            Command::Event(_) => "event",
            Command::Buffer(_) => "buffer",
            Command::Alive(_) => "alive",
        }
    }
}

/// Request to call a registered function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeCommand {
    pub function_id: FunctionId,
    pub call_id: CallId,
    #[serde(default)]
    pub this_arg: Json,
    #[serde(default)]
    pub args: Vec<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_info: Option<String>,
}

/// Outcome of an `invoke`, correlated by `call_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultCommand {
    pub call_id: CallId,
    pub status: u8,
    #[serde(default)]
    pub result: Json,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ResultCommand {
    pub fn success(call_id: CallId, result: Json) -> Self {
        Self {
            call_id,
            status: STATUS_OK,
            result,
            message: None,
        }
    }

    pub fn failure(call_id: CallId, message: impl Into<String>) -> Self {
        Self {
            call_id,
            status: STATUS_ERROR,
            result: Json::Null,
            message: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == STATUS_OK
    }
}

/// Event fired on a tracked object, pushed to each subscribed session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventCommand {
    pub source_object_id: ObjectId,
    pub event_name: String,
    #[serde(default)]
    pub args: Vec<Json>,
}

/// Announces the next binary frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferHeader {
    pub id: BufferId,
    pub length: usize,
}

/// Ids the server still tracks after a GC cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AliveCommand {
    pub alive_ids: Vec<ObjectId>,
}

/// Wire form of a registered type, returned by the root `getType` method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeInfo {
    pub name: String,
    pub policy: ReferencePolicy,
    /// Method name to function id.
    #[serde(default)]
    pub methods: BTreeMap<String, FunctionId>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub client_methods: BTreeMap<String, ClientMethodDef>,
    /// Key of the serializer pair the receiver must apply, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serializer: Option<String>,
}

/// Source of a method evaluated on the receiving side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMethodDef {
    pub args: Vec<String>,
    pub body: String,
}
