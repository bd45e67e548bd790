/// sharebox server: authenticates identities over a framed byte stream and
/// serves workspace commands against the metadata store and workspace trees.
///
/// One thread per connection, blocking I/O only. A metadata integrity
/// violation in any session stops the whole server.

pub mod config;
pub mod server;
pub mod session;

pub use config::{ConfigError, IntegrityPolicy, ServerConfig};
pub use server::{Server, ServerError, ShutdownHandle};
pub use session::{AppState, ConnectionOptions, Session, SessionError};
