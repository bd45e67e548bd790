use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

use sharebox_crypto::encrypt::encrypt_stream;
use sharebox_crypto::keys::SIGNATURE_SIZE;
use sharebox_crypto::sign::sign_file;
use sharebox_crypto::{SecretKey, WorkspaceKey};
use sharebox_types::models::validate_file_name;
use sharebox_types::{Command, FileOutcome, FileStatus, Status, UploadMarker};
use tracing::{debug, warn};

use crate::{BatchReport, Client, ClientError, FileResult};

/// A file ready to send: ciphertext in an anonymous temp file plus the
/// signature over its plaintext.
struct Prepared {
    ciphertext: File,
    len: u64,
    signature: [u8; SIGNATURE_SIZE],
}

fn prepare(secret: &SecretKey, key: &WorkspaceKey, path: &Path) -> Result<Prepared, ClientError> {
    let signature = sign_file(secret, path)?;
    let plaintext = BufReader::new(File::open(path)?);
    let mut ciphertext = tempfile::tempfile()?;
    encrypt_stream(key, plaintext, &mut ciphertext)?;
    let len = ciphertext.seek(SeekFrom::End(0))?;
    ciphertext.seek(SeekFrom::Start(0))?;
    Ok(Prepared { ciphertext, len, signature })
}

impl<S: Read + Write> Client<S> {
    /// Sign, encrypt and upload local files. Each is stored under its file
    /// name, replacing any earlier version.
    pub fn upload<P: AsRef<Path>>(&mut self, workspace: &str, paths: &[P]) -> Result<BatchReport, ClientError> {
        let mut local_failures = Vec::new();
        let mut sendable = Vec::new();
        for path in paths {
            let path = path.as_ref();
            match path.file_name().and_then(|n| n.to_str()) {
                Some(name) if validate_file_name(name).is_ok() => sendable.push((name.to_string(), path)),
                _ => local_failures.push((path.display().to_string(), FileResult::Local("invalid file name".into()))),
            }
        }
        if sendable.is_empty() {
            return Ok(BatchReport { status: Status::Nok, files: local_failures });
        }

        let files = sendable.iter().map(|(name, _)| name.clone()).collect();
        let status = self.request(&Command::Upload { workspace: workspace.to_string(), files })?;
        let mut report = BatchReport { status, files: local_failures };
        if !status.is_ok() {
            return Ok(report);
        }
        let key = self.receive_workspace_key(workspace)?;

        for (name, path) in sendable {
            let prepared = match &key {
                Some(key) => prepare(&self.secret, key, path).map_err(|e| e.to_string()),
                None => Err("workspace key unavailable".to_string()),
            };

            let result = match prepared {
                Ok(prepared) => {
                    self.channel.send_message(&UploadMarker::Ready.to_string())?;
                    self.channel.send_reader(prepared.ciphertext, prepared.len)?;
                    self.channel.send_bytes(&prepared.signature)?;
                    let status: FileStatus = self.channel.receive_message()?.parse()?;
                    debug!("Uploaded {}: {}", name, status);
                    FileResult::Remote(status.outcome)
                }
                Err(reason) => {
                    warn!("Skipping {}: {}", name, reason);
                    self.channel.send_message(&UploadMarker::Skip(reason.clone()).to_string())?;
                    let _: FileStatus = self.channel.receive_message()?.parse()?;
                    FileResult::Local(reason)
                }
            };
            report.files.push((name, result));
        }
        Ok(report)
    }
}
