pub mod admission;
pub mod auth;
pub mod config;
pub mod conn;
pub mod error;
/// Portero - a transparent, connection-pooling proxy for MongoDB
///
/// Clients speak the MongoDB wire protocol to portero as if it were the
/// server; portero multiplexes their requests onto a bounded pool of
/// persistent upstream connections. Mutation ops keep their upstream bound
/// to the session for `getLastError` follow-ups, per-IP admission bounds
/// concurrent clients, and shutdown can drain sessions gracefully or tear
/// them down hard.
pub mod pool;
pub mod proxy;
pub mod query;
pub mod stats;
pub mod utils;
pub mod wire;

pub use auth::{Authenticator, Credential, NoAuth};
pub use config::Config;
pub use error::{ConfigError, ProxyError, ProxyResult};
pub use proxy::{Proxy, ProxyOptions};
pub use query::{LastError, QueryProxy, TransparentQueryProxy};
pub use stats::{MemoryStats, NoopStats, Stats};
