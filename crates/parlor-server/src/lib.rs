pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod fanout;
pub mod health;
pub mod registry;
pub mod server;
pub mod session;

pub use config::{load_config, ServerConfig};
pub use connection::ConnectionSettings;
pub use dispatcher::Dispatcher;
pub use error::{CommandError, ConfigError, DeliveryError, ServerError};
pub use fanout::{Fanout, FanoutReport};
pub use registry::{JoinOutcome, PresenceRegistry, Registry};
pub use server::{build_router, start, AppState, ServerHandle};
pub use session::{Session, SessionUser};
