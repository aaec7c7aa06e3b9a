//! IO modules - container framing, streaming codecs, signing, remote reads

pub mod checksum;
pub mod container;
#[cfg(feature = "network")]
pub mod remote;
pub mod stream_reader;
pub mod stream_writer;

use std::io;
use std::process::{Child, Command, Stdio};

use crate::error::{GpkgError, Result};

/// Block size for pipe copies.
pub(crate) const PIPE_CHUNK: usize = 64 * 1024;

/// Spawn an external codec with piped stdin/stdout; stderr is inherited.
pub(crate) fn spawn_codec(argv: &[String]) -> Result<(Child, String)> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| GpkgError::UnsupportedCodec("empty codec command".to_string()))?;

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => GpkgError::UnsupportedCodec(format!("{program}: {e}")),
            _ => GpkgError::Io(e),
        })?;
    Ok((child, program.clone()))
}
