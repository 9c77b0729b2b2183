//! Database entities

pub mod command;
pub mod http_request;
pub mod session_status;
pub mod task_status;
pub mod tunnel_session;

pub use command::Entity as Command;
pub use http_request::Entity as HttpRequest;
pub use session_status::SessionStatus;
pub use task_status::TaskStatus;
pub use tunnel_session::Entity as TunnelSession;

pub mod prelude {
    pub use super::command::Entity as Command;
    pub use super::http_request::Entity as HttpRequest;
    pub use super::tunnel_session::Entity as TunnelSession;
}
