/// Shared vocabulary for the sharebox server and client.
///
/// - `models`: metadata records (`users.txt`, `workspaces.txt`) and name rules
/// - `api`: wire commands and the exact response tokens exchanged over the channel

pub mod api;
pub mod models;

pub use api::{AuthStatus, Command, FileOutcome, FileStatus, ParseError, Status, UploadMarker};
pub use models::{NameError, RecordError, UserRecord, WorkspaceRecord};
