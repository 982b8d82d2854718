//! LiveObj Core - transparent remote objects over a message channel.
//!
//! A server registers types and methods in a [`Registry`] and publishes
//! objects; clients receive them as [`RemoteProxy`] handles whose methods
//! run on the server. Objects are passed by reference (tracked by id, kept
//! alive by client pings) or by value, and binary payloads travel as
//! separate frames.
//!
//! # Example
//!
//! ```rust,ignore
//! use liveobj_core::{Client, ClientOptions, MemoryConnector, Registry, Server, ServerOptions};
//!
//! #[tokio::main]
//! async fn main() -> liveobj_core::Result<()> {
//!     let mut registry = Registry::new();
//!     registry.register_function("sum", |args| {
//!         Ok((args.f64(0)? + args.f64(1)?).into())
//!     })?;
//!     let server = Server::new(registry, ServerOptions::default());
//!     server.start();
//!
//!     let client = Client::connect(MemoryConnector::new(server), ClientOptions::default()).await?;
//!     let three = client.root()?.call("sum", vec![1.into(), 2.into()]).await?;
//!     println!("1 + 2 = {:?}", three);
//!     Ok(())
//! }
//! ```

pub mod binary;
pub mod builtin;
pub mod cancel;
pub mod client;
pub mod codec;
pub mod config;
pub mod directory;
pub mod error;
pub mod expr;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod transport;
pub mod value;

// Re-export commonly used types
pub use builtin::{RemoteMap, Timestamp};
pub use cancel::CancellationToken;
pub use client::{Client, ConnectionStatus, HookLibrary, ListenerId, LocalType, RemoteProxy};
pub use config::{ClientOptions, ProtocolConfig, ServerOptions};
pub use directory::AgentId;
pub use error::{LiveObjError, Result};
pub use protocol::{BufferId, FunctionId, ObjectId};
pub use registry::{Args, ReferencePolicy, Registry, SerializationHooks};
pub use server::{CallContext, Server};
pub use transport::{Channel, Connector, Frame, MemoryConnector, WsConnector};
pub use value::{Instance, Object, Properties, RemoteObject, Value};
