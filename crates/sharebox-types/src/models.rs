use std::fmt;
use std::str::FromStr;

/// Prefix of every personal workspace (`workspace<identity>`); reserved for
/// user-created workspace names.
pub const PERSONAL_WORKSPACE_PREFIX: &str = "workspace";

/// Maximum length of identities and workspace names, in bytes.
pub const MAX_NAME_LEN: usize = 64;

/// Maximum length of a stored file name, in bytes.
pub const MAX_FILE_NAME_LEN: usize = 255;

/// Infix of envelope files: `<workspace>.key.<member>`.
pub const ENVELOPE_INFIX: &str = ".key.";

/// Infix of signature files: `<file>.signed.<signer>`.
pub const SIGNATURE_INFIX: &str = ".signed.";

/// Name of the workspace auto-created for a newly provisioned identity.
pub fn personal_workspace(identity: &str) -> String {
    format!("{PERSONAL_WORKSPACE_PREFIX}{identity}")
}

// -- Name rules --

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("name is empty")]
    Empty,
    #[error("name is {0} bytes long")]
    TooLong(usize),
    #[error("name contains invalid character {0:?}")]
    InvalidChar(char),
    #[error("name contains reserved text {0:?}")]
    Reserved(&'static str),
    #[error("name starts with '.'")]
    Hidden,
}

fn validate_token(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(NameError::TooLong(name.len()));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@')))
    {
        return Err(NameError::InvalidChar(c));
    }
    Ok(())
}

/// Identities appear in record lines and in envelope/signature file names.
pub fn validate_identity(identity: &str) -> Result<(), NameError> {
    validate_token(identity)
}

/// Workspace names share the identity charset. The reserved-prefix rule
/// applies only to CREATE and is checked there.
pub fn validate_workspace_name(name: &str) -> Result<(), NameError> {
    validate_token(name)?;
    if name.starts_with('.') {
        return Err(NameError::Hidden);
    }
    Ok(())
}

/// File names may not escape the workspace directory, collide with envelopes
/// or signatures, or break the comma-separated wire list.
pub fn validate_file_name(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() > MAX_FILE_NAME_LEN {
        return Err(NameError::TooLong(name.len()));
    }
    if name.starts_with('.') {
        return Err(NameError::Hidden);
    }
    if let Some(c) = name
        .chars()
        .find(|c| matches!(c, '/' | '\\' | ',' | ':') || c.is_whitespace() || c.is_control())
    {
        return Err(NameError::InvalidChar(c));
    }
    for infix in [ENVELOPE_INFIX, SIGNATURE_INFIX] {
        if name.contains(infix) {
            return Err(NameError::Reserved(infix));
        }
    }
    Ok(())
}

// -- Records --

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("record {line:?} is missing the {field} field")]
    MissingField { line: String, field: &'static str },
    #[error("record {line:?} has an invalid name: {source}")]
    InvalidName { line: String, source: NameError },
}

/// One line of `users.txt`: `identity:saltedDigest:salt`.
///
/// Digest and salt are base64; the digest is the password KDF output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub identity: String,
    pub digest: String,
    pub salt: String,
}

impl fmt::Display for UserRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.identity, self.digest, self.salt)
    }
}

impl FromStr for UserRecord {
    type Err = RecordError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut parts = line.splitn(3, ':');
        let missing = |field| RecordError::MissingField { line: line.to_string(), field };

        let identity = parts.next().filter(|s| !s.is_empty()).ok_or_else(|| missing("identity"))?;
        let digest = parts.next().filter(|s| !s.is_empty()).ok_or_else(|| missing("digest"))?;
        let salt = parts.next().filter(|s| !s.is_empty()).ok_or_else(|| missing("salt"))?;

        validate_identity(identity).map_err(|source| RecordError::InvalidName {
            line: line.to_string(),
            source,
        })?;

        Ok(Self {
            identity: identity.to_string(),
            digest: digest.to_string(),
            salt: salt.to_string(),
        })
    }
}

/// One line of `workspaces.txt`: `name:owner:member1,member2,...`.
///
/// The owner is always a member; membership only ever grows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceRecord {
    pub name: String,
    pub owner: String,
    pub members: Vec<String>,
}

impl WorkspaceRecord {
    pub fn new(name: &str, owner: &str) -> Self {
        Self {
            name: name.to_string(),
            owner: owner.to_string(),
            members: vec![owner.to_string()],
        }
    }

    pub fn is_owner(&self, identity: &str) -> bool {
        self.owner == identity
    }

    /// Exact match against the member list.
    pub fn is_member(&self, identity: &str) -> bool {
        self.is_owner(identity) || self.members.iter().any(|m| m == identity)
    }

    /// Returns `false` when the identity was already a member.
    pub fn add_member(&mut self, identity: &str) -> bool {
        if self.is_member(identity) {
            return false;
        }
        self.members.push(identity.to_string());
        true
    }
}

impl fmt::Display for WorkspaceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.name, self.owner, self.members.join(","))
    }
}

impl FromStr for WorkspaceRecord {
    type Err = RecordError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut parts = line.splitn(3, ':');
        let missing = |field| RecordError::MissingField { line: line.to_string(), field };
        let invalid = |source| RecordError::InvalidName { line: line.to_string(), source };

        let name = parts.next().filter(|s| !s.is_empty()).ok_or_else(|| missing("name"))?;
        let owner = parts.next().filter(|s| !s.is_empty()).ok_or_else(|| missing("owner"))?;
        let members = parts.next().ok_or_else(|| missing("members"))?;

        validate_workspace_name(name).map_err(invalid)?;
        validate_identity(owner).map_err(invalid)?;

        let mut record = Self::new(name, owner);
        for member in members.split(',').map(str::trim).filter(|m| !m.is_empty()) {
            validate_identity(member).map_err(invalid)?;
            record.add_member(member);
        }
        Ok(record)
    }
}
