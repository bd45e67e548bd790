use std::fmt;
use std::str::FromStr;

// -- Parse errors --

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty command")]
    Empty,
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("{command} expects {expected} arguments, got {got}")]
    Arity {
        command: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("unexpected token {0:?}")]
    UnexpectedToken(String),
    #[error("malformed listing {0:?}")]
    Listing(String),
}

// -- Commands --

/// A command sent by an authenticated client.
///
/// Wire form is a single space-delimited line; file lists are comma-separated.
#[derive(Clone, PartialEq, Eq)]
pub enum Command {
    Create { workspace: String, password: String },
    Add { user: String, workspace: String },
    Upload { workspace: String, files: Vec<String> },
    Download { workspace: String, files: Vec<String> },
    Remove { workspace: String, files: Vec<String> },
    ListWorkspaces,
    ListFiles { workspace: String },
}

impl Command {
    /// The head token, safe to log.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Create { .. } => "CREATE",
            Self::Add { .. } => "ADD",
            Self::Upload { .. } => "UP",
            Self::Download { .. } => "DW",
            Self::Remove { .. } => "RM",
            Self::ListWorkspaces => "LW",
            Self::ListFiles { .. } => "LS",
        }
    }

    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let (&head, args) = tokens.split_first().ok_or(ParseError::Empty)?;

        let arity = |command: &'static str, expected: usize| {
            if args.len() == expected {
                Ok(())
            } else {
                Err(ParseError::Arity { command, expected, got: args.len() })
            }
        };

        let command = match head {
            "CREATE" => {
                arity("CREATE", 2)?;
                Self::Create { workspace: args[0].to_string(), password: args[1].to_string() }
            }
            "ADD" => {
                arity("ADD", 2)?;
                Self::Add { user: args[0].to_string(), workspace: args[1].to_string() }
            }
            "UP" => {
                arity("UP", 2)?;
                Self::Upload { workspace: args[0].to_string(), files: split_files(args[1]) }
            }
            "DW" => {
                arity("DW", 2)?;
                Self::Download { workspace: args[0].to_string(), files: split_files(args[1]) }
            }
            "RM" => {
                arity("RM", 2)?;
                Self::Remove { workspace: args[0].to_string(), files: split_files(args[1]) }
            }
            "LW" => {
                arity("LW", 0)?;
                Self::ListWorkspaces
            }
            "LS" => {
                arity("LS", 1)?;
                Self::ListFiles { workspace: args[0].to_string() }
            }
            other => return Err(ParseError::UnknownCommand(other.to_string())),
        };
        Ok(command)
    }
}

fn split_files(list: &str) -> Vec<String> {
    list.split(',')
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create { workspace, password } => write!(f, "CREATE {workspace} {password}"),
            Self::Add { user, workspace } => write!(f, "ADD {user} {workspace}"),
            Self::Upload { workspace, files } => write!(f, "UP {workspace} {}", files.join(",")),
            Self::Download { workspace, files } => write!(f, "DW {workspace} {}", files.join(",")),
            Self::Remove { workspace, files } => write!(f, "RM {workspace} {}", files.join(",")),
            Self::ListWorkspaces => f.write_str("LW"),
            Self::ListFiles { workspace } => write!(f, "LS {workspace}"),
        }
    }
}

// Debug never prints the CREATE password.
impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create { workspace, .. } => f
                .debug_struct("Create")
                .field("workspace", workspace)
                .field("password", &"<redacted>")
                .finish(),
            Self::Add { user, workspace } => f
                .debug_struct("Add")
                .field("user", user)
                .field("workspace", workspace)
                .finish(),
            Self::Upload { workspace, files } => {
                f.debug_struct("Upload").field("workspace", workspace).field("files", files).finish()
            }
            Self::Download { workspace, files } => {
                f.debug_struct("Download").field("workspace", workspace).field("files", files).finish()
            }
            Self::Remove { workspace, files } => {
                f.debug_struct("Remove").field("workspace", workspace).field("files", files).finish()
            }
            Self::ListWorkspaces => f.write_str("ListWorkspaces"),
            Self::ListFiles { workspace } => {
                f.debug_struct("ListFiles").field("workspace", workspace).finish()
            }
        }
    }
}

// -- Response tokens --

/// Command-level outcome of an access check or a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Nok,
    NoWorkspace,
    NoPermission,
    NoUser,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Nok => "NOK",
            Self::NoWorkspace => "NOWS",
            Self::NoPermission => "NOPERM",
            Self::NoUser => "NOUSER",
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OK" => Ok(Self::Ok),
            "NOK" => Ok(Self::Nok),
            "NOWS" => Ok(Self::NoWorkspace),
            "NOPERM" => Ok(Self::NoPermission),
            "NOUSER" => Ok(Self::NoUser),
            other => Err(ParseError::UnexpectedToken(other.to_string())),
        }
    }
}

/// Handshake outcome sent after each password attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    /// Unknown identity; user and personal workspace were provisioned.
    NewUser,
    Authenticated,
    WrongPassword,
    /// Handshake refused (unknown key, invalid identity, too many attempts).
    Rejected,
}

impl AuthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewUser => "OK-NEW-USER",
            Self::Authenticated => "OK-USER",
            Self::WrongPassword => "WRONG-PWD",
            Self::Rejected => "NOK",
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::NewUser | Self::Authenticated)
    }
}

impl fmt::Display for AuthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OK-NEW-USER" => Ok(Self::NewUser),
            "OK-USER" => Ok(Self::Authenticated),
            "WRONG-PWD" => Ok(Self::WrongPassword),
            "NOK" => Ok(Self::Rejected),
            other => Err(ParseError::UnexpectedToken(other.to_string())),
        }
    }
}

/// Per-file marker the client sends during UP, before any payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadMarker {
    /// Ciphertext frame and signature frame follow.
    Ready,
    /// The client could not prepare this file; nothing follows.
    Skip(String),
}

impl fmt::Display for UploadMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => f.write_str("READY"),
            Self::Skip(reason) => write!(f, "SKIP {reason}"),
        }
    }
}

impl FromStr for UploadMarker {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "READY" {
            return Ok(Self::Ready);
        }
        match s.split_once(' ') {
            Some(("SKIP", reason)) => Ok(Self::Skip(reason.to_string())),
            _ if s == "SKIP" => Ok(Self::Skip(String::new())),
            _ => Err(ParseError::UnexpectedToken(s.to_string())),
        }
    }
}

/// Result for one file of a batch command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Ok,
    Deleted,
    NotFound,
    Failed(String),
}

/// A `<name>: <outcome>` status line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStatus {
    pub name: String,
    pub outcome: FileOutcome,
}

impl FileStatus {
    pub fn new(name: &str, outcome: FileOutcome) -> Self {
        Self { name: name.to_string(), outcome }
    }

    pub fn failed(name: &str, reason: impl fmt::Display) -> Self {
        Self::new(name, FileOutcome::Failed(reason.to_string()))
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            FileOutcome::Ok => write!(f, "{}: OK", self.name),
            FileOutcome::Deleted => write!(f, "{}: DELETED", self.name),
            FileOutcome::NotFound => write!(f, "{}: NOTFOUND", self.name),
            FileOutcome::Failed(reason) => write!(f, "{}: NOK {}", self.name, reason),
        }
    }
}

impl FromStr for FileStatus {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let (name, rest) = line
            .split_once(": ")
            .ok_or_else(|| ParseError::UnexpectedToken(line.to_string()))?;
        let outcome = match rest {
            "OK" => FileOutcome::Ok,
            "DELETED" => FileOutcome::Deleted,
            "NOTFOUND" => FileOutcome::NotFound,
            "NOK" => FileOutcome::Failed(String::new()),
            _ => match rest.strip_prefix("NOK ") {
                Some(reason) => FileOutcome::Failed(reason.to_string()),
                None => return Err(ParseError::UnexpectedToken(line.to_string())),
            },
        };
        Ok(Self { name: name.to_string(), outcome })
    }
}

// -- Listings --

/// Format a listing as `{ a, b }`, or `{ }` when empty.
pub fn format_listing<S: AsRef<str>>(items: &[S]) -> String {
    if items.is_empty() {
        return "{ }".to_string();
    }
    let joined: Vec<&str> = items.iter().map(AsRef::as_ref).collect();
    format!("{{ {} }}", joined.join(", "))
}

pub fn parse_listing(text: &str) -> Result<Vec<String>, ParseError> {
    let inner = text
        .trim()
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .ok_or_else(|| ParseError::Listing(text.to_string()))?;
    Ok(inner
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_command() {
        assert_eq!(
            Command::parse("CREATE reports s3cret").unwrap(),
            Command::Create { workspace: "reports".into(), password: "s3cret".into() }
        );
        assert_eq!(
            Command::parse("ADD bob reports").unwrap(),
            Command::Add { user: "bob".into(), workspace: "reports".into() }
        );
        assert_eq!(
            Command::parse("UP reports a.txt,b.txt,").unwrap(),
            Command::Upload { workspace: "reports".into(), files: vec!["a.txt".into(), "b.txt".into()] }
        );
        assert_eq!(Command::parse("LW").unwrap(), Command::ListWorkspaces);
        assert_eq!(
            Command::parse("LS reports").unwrap(),
            Command::ListFiles { workspace: "reports".into() }
        );
    }

    #[test]
    fn rejects_malformed_commands() {
        assert_eq!(Command::parse("   "), Err(ParseError::Empty));
        assert_eq!(Command::parse("PUT x"), Err(ParseError::UnknownCommand("PUT".into())));
        assert_eq!(
            Command::parse("ADD bob"),
            Err(ParseError::Arity { command: "ADD", expected: 2, got: 1 })
        );
        assert!(Command::parse("LW extra").is_err());
    }

    #[test]
    fn wire_form_parses_back() {
        let cmd = Command::Download { workspace: "reports".into(), files: vec!["a".into(), "b".into()] };
        assert_eq!(cmd.to_string(), "DW reports a,b");
        assert_eq!(Command::parse(&cmd.to_string()).unwrap(), cmd);
    }

    #[test]
    fn debug_redacts_password() {
        let cmd = Command::Create { workspace: "reports".into(), password: "hunter2".into() };
        let debug = format!("{cmd:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("reports"));
    }

    #[test]
    fn tokens_match_wire_strings() {
        assert_eq!(Status::NoWorkspace.to_string(), "NOWS");
        assert_eq!("NOPERM".parse::<Status>().unwrap(), Status::NoPermission);
        assert_eq!(AuthStatus::NewUser.to_string(), "OK-NEW-USER");
        assert_eq!("WRONG-PWD".parse::<AuthStatus>().unwrap(), AuthStatus::WrongPassword);
        assert!("MAYBE".parse::<Status>().is_err());
    }

    #[test]
    fn file_status_lines() {
        let line = FileStatus::failed("a.txt", "invalid name").to_string();
        assert_eq!(line, "a.txt: NOK invalid name");
        assert_eq!(
            line.parse::<FileStatus>().unwrap().outcome,
            FileOutcome::Failed("invalid name".into())
        );
        assert_eq!("b.txt: DELETED".parse::<FileStatus>().unwrap().outcome, FileOutcome::Deleted);
        assert!("garbage".parse::<FileStatus>().is_err());
    }

    #[test]
    fn upload_markers() {
        assert_eq!("READY".parse::<UploadMarker>().unwrap(), UploadMarker::Ready);
        assert_eq!(
            "SKIP no such file".parse::<UploadMarker>().unwrap(),
            UploadMarker::Skip("no such file".into())
        );
        assert!("GO".parse::<UploadMarker>().is_err());
    }

    #[test]
    fn listings() {
        assert_eq!(format_listing::<&str>(&[]), "{ }");
        assert_eq!(format_listing(&["a", "b"]), "{ a, b }");
        assert_eq!(parse_listing("{ a, b }").unwrap(), vec!["a", "b"]);
        assert!(parse_listing("{ }").unwrap().is_empty());
        assert!(parse_listing("a, b").is_err());
    }
}
