//! Network-related constants.

/// Default port for the rudder API server.
pub const DEFAULT_API_PORT: u16 = 3000;

/// Name of the user-defined bridge network all pods are attached to.
pub const POD_NETWORK: &str = "orchestrator-net";

/// Host address load-balancer listener ports are published on.
pub const LB_BIND_ADDR: &str = "127.0.0.1";
