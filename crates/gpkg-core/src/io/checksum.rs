//! Multi-digest accumulator with an optional detached signer or verifier.
//!
//! The same bytes feed every configured digest and, when a signing mode is
//! active, the stdin of an external program. The program's stdout and stderr
//! are drained on their own threads so a chatty tool can never block the
//! writer.

use std::io::{self, Read, Write};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};

use gpkg_schema::{DigestAlgorithm, MultiDigest};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::config::{SIGNATURE_PLACEHOLDER, SignMode};
use crate::error::{GpkgError, Result};

/// Result of a finished checksum stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumOutcome {
    /// Hex digests in configuration order.
    pub digests: Vec<(DigestAlgorithm, String)>,
    /// Detached signature produced in signing mode.
    pub signature: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Sign,
    Verify,
}

struct Helper {
    role: Role,
    program: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: JoinHandle<io::Result<Vec<u8>>>,
    stderr: JoinHandle<io::Result<Vec<u8>>>,
    // Kept alive until the verifier exits.
    _signature_file: Option<NamedTempFile>,
}

/// Computes digests over a stream and optionally drives a signer or verifier.
pub struct ChecksumSigner {
    digest: MultiDigest,
    helper: Option<Helper>,
    broken_pipe: bool,
}

impl std::fmt::Debug for ChecksumSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChecksumSigner")
            .field("algorithms", &self.digest.algorithms())
            .field("helper", &self.helper.as_ref().map(|h| (h.role, &h.program)))
            .finish_non_exhaustive()
    }
}

impl ChecksumSigner {
    /// Start digests for `algorithms` and, depending on `mode`, spawn the
    /// external signer or verifier.
    ///
    /// # Errors
    ///
    /// Returns [`GpkgError::Signing`] if the helper program cannot be started,
    /// or an I/O error writing the signature temp file.
    pub fn new(algorithms: &[DigestAlgorithm], mode: SignMode) -> Result<Self> {
        let helper = match mode {
            SignMode::None => None,
            SignMode::Sign(argv) => Some(spawn_helper(Role::Sign, &argv, None)?),
            SignMode::Verify { command, signature } => {
                let mut file = NamedTempFile::new()?;
                file.write_all(&signature)?;
                file.flush()?;
                let sig_path = file.path().to_string_lossy().into_owned();
                let argv: Vec<String> = command
                    .into_iter()
                    .map(|arg| {
                        if arg == SIGNATURE_PLACEHOLDER {
                            sig_path.clone()
                        } else {
                            arg
                        }
                    })
                    .collect();
                Some(spawn_helper(Role::Verify, &argv, Some(file))?)
            }
        };

        Ok(Self {
            digest: MultiDigest::new(algorithms),
            helper,
            broken_pipe: false,
        })
    }

    /// Feed bytes to every digest and to the helper, if any.
    ///
    /// A helper that stops reading early is remembered and reported by
    /// [`finish`](Self::finish); hashing continues regardless.
    ///
    /// # Errors
    ///
    /// Returns an I/O error other than a broken pipe from the helper's stdin.
    pub fn update(&mut self, data: &[u8]) -> Result<()> {
        self.digest.update(data);
        if let Some(helper) = &mut self.helper {
            if let Some(stdin) = &mut helper.stdin {
                if let Err(err) = stdin.write_all(data) {
                    if err.kind() != io::ErrorKind::BrokenPipe {
                        return Err(err.into());
                    }
                    debug!(program = %helper.program, "Helper closed its input early");
                    self.broken_pipe = true;
                    helper.stdin = None;
                }
            }
        }
        Ok(())
    }

    /// Close the helper's input, wait for it, and return digests plus any signature.
    ///
    /// # Errors
    ///
    /// In signing mode a failed signer is [`GpkgError::Signing`]. In verifying
    /// mode a failed exit, or a log missing either the good-signature or the
    /// full-trust status line, is [`GpkgError::InvalidSignature`].
    pub fn finish(self) -> Result<ChecksumOutcome> {
        let digests = self.digest.finalize();
        let Some(mut helper) = self.helper else {
            return Ok(ChecksumOutcome {
                digests,
                signature: None,
            });
        };

        drop(helper.stdin.take());
        let status = helper.child.wait()?;
        let stdout = join_output(helper.stdout)?;
        let stderr = join_output(helper.stderr)?;

        match helper.role {
            Role::Sign => {
                check_signer(&helper.program, status, &stdout, &stderr, self.broken_pipe)?;
                Ok(ChecksumOutcome {
                    digests,
                    signature: Some(stdout),
                })
            }
            Role::Verify => {
                check_verifier(&helper.program, status, &stdout, &stderr, self.broken_pipe)?;
                Ok(ChecksumOutcome {
                    digests,
                    signature: None,
                })
            }
        }
    }
}

impl Write for ChecksumSigner {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf).map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn spawn_helper(role: Role, argv: &[String], signature_file: Option<NamedTempFile>) -> Result<Helper> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| GpkgError::Config("empty signing command".to_string()))?;

    debug!(?role, %program, "Starting signature helper");
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| GpkgError::Signing(format!("cannot start {program}: {e}")))?;

    let stdin = child.stdin.take();
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    Ok(Helper {
        role,
        program: program.clone(),
        child,
        stdin,
        stdout,
        stderr,
        _signature_file: signature_file,
    })
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<io::Result<Vec<u8>>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_end(&mut buf)?;
        }
        Ok(buf)
    })
}

fn join_output(handle: JoinHandle<io::Result<Vec<u8>>>) -> Result<Vec<u8>> {
    handle
        .join()
        .map_err(|_| io::Error::other("helper output thread panicked"))?
        .map_err(GpkgError::from)
}

fn check_signer(
    program: &str,
    status: ExitStatus,
    stdout: &[u8],
    stderr: &[u8],
    broken_pipe: bool,
) -> Result<()> {
    if !status.success() {
        return Err(GpkgError::Signing(format!(
            "{program} exited with {status}: {}",
            String::from_utf8_lossy(stderr).trim()
        )));
    }
    if broken_pipe {
        return Err(GpkgError::Signing(format!(
            "{program} stopped reading before the end of the data"
        )));
    }
    if stdout.is_empty() {
        return Err(GpkgError::Signing(format!("{program} produced no signature")));
    }
    Ok(())
}

fn check_verifier(
    program: &str,
    status: ExitStatus,
    stdout: &[u8],
    stderr: &[u8],
    broken_pipe: bool,
) -> Result<()> {
    if !status.success() {
        return Err(GpkgError::InvalidSignature(format!(
            "{program} exited with {status}"
        )));
    }
    if broken_pipe {
        return Err(GpkgError::InvalidSignature(format!(
            "{program} stopped reading before the end of the data"
        )));
    }

    let log = format!(
        "{}\n{}",
        String::from_utf8_lossy(stdout),
        String::from_utf8_lossy(stderr)
    );
    let parsed = parse_status(&log);
    if !parsed.good {
        return Err(GpkgError::InvalidSignature(
            "no good signature reported".to_string(),
        ));
    }
    if !parsed.trusted {
        return Err(GpkgError::InvalidSignature(
            "signer is not fully trusted".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Default, PartialEq, Eq)]
struct VerifyStatus {
    good: bool,
    trusted: bool,
}

fn parse_status(log: &str) -> VerifyStatus {
    let mut status = VerifyStatus::default();
    for line in log.lines() {
        let Some(rest) = line.trim().strip_prefix("[GNUPG:] ") else {
            continue;
        };
        match rest.split_whitespace().next() {
            Some("GOODSIG" | "VALIDSIG") => status.good = true,
            Some("TRUST_FULL" | "TRUST_ULTIMATE") => status.trusted = true,
            Some("BADSIG" | "ERRSIG" | "EXPSIG" | "EXPKEYSIG" | "REVKEYSIG") => {
                return VerifyStatus::default();
            }
            _ => {}
        }
    }
    status
}
