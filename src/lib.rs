//! Beez peer-to-peer blockchain node.
//!
//! [`node::Node`] owns the live [`blockchain::Blockchain`], the
//! [`pool::TransactionPool`] and the [`chunks::PendingChunks`] tracker, and is
//! driven by peer messages routed through [`dispatch::MessageDispatcher`].
//! Peers are reached through the [`transport::PeerTransport`] seam, with
//! [`transport::TcpTransport`] as the production implementation.
//!
//! Applications typically load a [`config::NodeConfig`], bind a transport,
//! build a [`node::Node`] and operate it through [`node::NodeHandle`].

pub mod blockchain;
pub mod chunks;
pub mod config;
pub mod consensus;
pub mod crypto;
pub mod dispatch;
pub mod errors;
pub mod node;
pub mod pool;
pub mod protocol;
pub mod state;
pub mod transport;
pub mod types;
pub mod worker;
