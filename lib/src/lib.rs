pub mod admin;
pub mod auth;
pub mod cluster;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod proxy;
pub mod server;
pub mod upstream;

pub use auth::{Token, TokenVerifier};
pub use cluster::{ClusterState, Node, NodeId, NodeStatus};
pub use config::{AuthConfig, Config};
pub use error::PikoError;
pub use server::Server;
