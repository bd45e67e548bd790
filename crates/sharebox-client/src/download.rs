use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use sharebox_crypto::WorkspaceKey;
use sharebox_crypto::encrypt::decrypt_stream;
use sharebox_crypto::sign::verify_file;
use sharebox_types::models::{SIGNATURE_INFIX, validate_file_name, validate_identity};
use sharebox_types::{Command, FileOutcome, FileStatus, Status};
use tracing::{info, warn};

use crate::{BatchReport, Client, ClientError, FileResult, partition_names};

/// Largest signature frame the client accepts.
const MAX_SIGNATURE_FRAME: usize = 4096;

impl<S: Read + Write> Client<S> {
    /// Download files into `dest`, decrypting and verifying each one.
    ///
    /// A verified file lands at `dest/<name>`. The signature is kept beside
    /// it as `<name>.signed.<signer>`, also when verification fails. A local
    /// failure on one file is reported for that file; the rest of the batch
    /// still arrives.
    pub fn download<N: AsRef<str>>(
        &mut self,
        workspace: &str,
        names: &[N],
        dest: &Path,
    ) -> Result<BatchReport, ClientError> {
        let (files, local_failures) = partition_names(names);
        if files.is_empty() {
            return Ok(BatchReport { status: Status::Nok, files: local_failures });
        }
        fs::create_dir_all(dest)?;

        let count = files.len();
        let status = self.request(&Command::Download { workspace: workspace.to_string(), files })?;
        let mut report = BatchReport { status, files: local_failures };
        if !status.is_ok() {
            return Ok(report);
        }
        let key = self.receive_workspace_key(workspace)?;

        for _ in 0..count {
            let line: FileStatus = self.channel.receive_message()?.parse()?;
            if line.outcome != FileOutcome::Ok {
                report.files.push((line.name, FileResult::Remote(line.outcome)));
                continue;
            }

            let signer = self.channel.receive_message()?;
            let signature = self.channel.receive_bytes(MAX_SIGNATURE_FRAME)?;
            let received = match tempfile::tempfile_in(dest) {
                Ok(mut file) => self.channel.receive_into_or_drain(&mut file)?.map(|_| file),
                Err(e) => {
                    self.channel.discard_payload()?;
                    Err(e)
                }
            };

            let result = match (received, &key) {
                (Err(e), _) => {
                    warn!("Cannot store {} locally: {}", line.name, e);
                    FileResult::Local(e.to_string())
                }
                (Ok(_), None) => FileResult::Local("workspace key unavailable".into()),
                (Ok(ciphertext), Some(key)) => self
                    .finish(key, &line.name, &signer, &signature, ciphertext, dest)
                    .unwrap_or_else(|e| {
                        warn!("Cannot finish {}: {}", line.name, e);
                        FileResult::Local(e.to_string())
                    }),
            };
            report.files.push((line.name, result));
        }
        Ok(report)
    }

    /// Decrypt and verify one received file. Touches only local state, so
    /// any error here belongs to this file alone.
    fn finish(
        &self,
        key: &WorkspaceKey,
        name: &str,
        signer: &str,
        signature: &[u8],
        mut ciphertext: File,
        dest: &Path,
    ) -> Result<FileResult, ClientError> {
        if validate_file_name(name).is_err() || validate_identity(signer).is_err() {
            warn!("Server sent unusable name {:?} or signer {:?}", name, signer);
            return Ok(FileResult::Local("unusable name from server".into()));
        }

        fs::write(dest.join(format!("{name}{SIGNATURE_INFIX}{signer}")), signature)?;
        let signer_key = match self.keys.public_key_of(signer) {
            Ok(key) => key,
            Err(e) => {
                warn!("Cannot verify {}: {}", name, e);
                return Ok(FileResult::Local(e.to_string()));
            }
        };

        ciphertext.seek(SeekFrom::Start(0))?;
        let mut plaintext = tempfile::Builder::new().prefix(".incoming-").tempfile_in(dest)?;
        let checked = decrypt_stream(key, &mut ciphertext, plaintext.as_file_mut())
            .and_then(|_| verify_file(&signer_key, plaintext.path(), signature));

        match checked {
            Ok(()) => {
                let path = dest.join(name);
                plaintext.persist(&path)?;
                info!("Downloaded {} (signed by {})", name, signer);
                Ok(FileResult::Downloaded { signer: signer.to_string(), path })
            }
            // Dropping `plaintext` removes it.
            Err(e) if e.is_integrity_failure() => {
                warn!("{} is corrupted: {}", name, e);
                Ok(FileResult::Corrupted { signer: signer.to_string() })
            }
            Err(e) => Ok(FileResult::Local(e.to_string())),
        }
    }
}
