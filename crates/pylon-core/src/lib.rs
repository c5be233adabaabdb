//! Pylon Core - named-peer RPC over persistent TCP connections.
//!
//! A server accepts many clients; each client names itself through periodic
//! heartbeats. Either side can call services registered on the other and
//! await the correlated response.
//!
//! # Example
//!
//! ```rust,ignore
//! use pylon_core::{Payload, Response, RpcClient, RpcServer, ServiceContext};
//!
//! #[tokio::main]
//! async fn main() -> pylon_core::Result<()> {
//!     let server = RpcServer::builder("devops", "0.0.0.0:9000").start().await?;
//!
//!     let client = RpcClient::builder("agent1", "127.0.0.1:9000")
//!         .register_service("status", |_ctx: ServiceContext, _payload: Payload| async move {
//!             Ok(Response::ok_with("up"))
//!         })
//!         .build()?;
//!     client.connect();
//!     client.await_connected().await?;
//!
//!     let response = server.send_to_client("agent1", "status", Payload::new()).await?;
//!     println!("{:?}", response.data);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod liveness;
pub mod message;
pub mod pending;
pub mod registry;
pub mod response;
pub mod router;
pub mod server;
pub mod worker;

// Re-export commonly used types
pub use client::{ConnectionState, RpcClient, RpcClientBuilder};
pub use config::{RpcConfig, RpcDefaults};
pub use connection::{ConnectionHandle, ConnectionId};
pub use error::{Result, RpcError};
pub use liveness::LivenessContext;
pub use message::{Message, Payload};
pub use registry::{ServiceContext, ServiceHandler, ServiceRegistry};
pub use response::{Response, ResponseCode};
pub use server::{RpcServer, RpcServerBuilder};
