//! Reverse proxy registrar
//!
//! Binds a public path (`/tunnel/{binding_id}/`) to the local port of a tunnel
//! session for as long as the session lives. The public HTTPS endpoint resolves
//! incoming requests through [`ProxyRegistry::lookup`] and forwards them to
//! `127.0.0.1:{local_port}`.

pub mod registry;

pub use registry::{BindingError, ProxyBinding, ProxyRegistry};

/// Path prefix under which every binding is exposed
pub const TUNNEL_PATH_PREFIX: &str = "/tunnel";
