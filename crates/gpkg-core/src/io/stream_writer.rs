//! Streams one entry of unknown length into a container.
//!
//! Without a codec, bytes go straight to the container (and the checksum
//! sink). With a codec, bytes go to the compressor's stdin while a reader
//! thread forwards its stdout over a channel; the writer drains that channel
//! after every write, so what gets hashed and signed is exactly what gets
//! stored.

use std::io::{self, Read, Seek, Write};
use std::process::{Child, ChildStdin};
use std::sync::mpsc::{self, Receiver};
use std::thread::{self, JoinHandle};

use gpkg_schema::DigestAlgorithm;
use tracing::debug;

use crate::config::CodecCommand;
use crate::error::{GpkgError, Result};
use crate::io::checksum::ChecksumSigner;
use crate::io::container::{ContainerWriter, EntryInfo, ReservedHeader};
use crate::io::{PIPE_CHUNK, spawn_codec};

/// A sealed entry with its digests and optional detached signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenEntry {
    /// Where the entry landed in the container.
    pub info: EntryInfo,
    /// Digests of the stored bytes; empty without a checksum sink.
    pub digests: Vec<(DigestAlgorithm, String)>,
    /// Signature over the stored bytes, when signing.
    pub signature: Option<Vec<u8>>,
}

struct PipedCodec {
    program: String,
    child: Child,
    stdin: Option<ChildStdin>,
    output: Receiver<io::Result<Vec<u8>>>,
    reader: Option<JoinHandle<()>>,
}

impl PipedCodec {
    fn spawn(argv: &[String]) -> Result<Self> {
        let (mut child, program) = spawn_codec(argv)?;
        let stdin = child.stdin.take();
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("compressor stdout was not captured"))?;

        let (tx, output) = mpsc::channel();
        let reader = thread::spawn(move || {
            let mut buf = vec![0u8; PIPE_CHUNK];
            loop {
                match stdout.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(Ok(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        break;
                    }
                }
            }
        });

        Ok(Self {
            program,
            child,
            stdin,
            output,
            reader: Some(reader),
        })
    }

    fn kill(mut self) {
        drop(self.stdin.take());
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

/// Writer for a single container entry.
///
/// Must end in [`close`](Self::close) or [`kill`](Self::kill). Dropping it
/// otherwise kills the codec and marks the container aborted.
pub struct EntryWriter<'a, W: Write + Seek> {
    container: &'a mut ContainerWriter<W>,
    reserved: Option<ReservedHeader>,
    checksum: Option<ChecksumSigner>,
    codec: Option<PipedCodec>,
    done: bool,
}

impl<W: Write + Seek> std::fmt::Debug for EntryWriter<'_, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryWriter")
            .field("name", &self.reserved.as_ref().map(ReservedHeader::name))
            .field("codec", &self.codec.as_ref().map(|c| &c.program))
            .field("checksum", &self.checksum)
            .finish_non_exhaustive()
    }
}

impl<'a, W: Write + Seek> EntryWriter<'a, W> {
    /// Reserve a header for `name` and start the codec, if any.
    ///
    /// # Errors
    ///
    /// Returns [`GpkgError::UnsupportedCodec`] if the codec cannot be started,
    /// or any error from reserving the header.
    pub fn open(
        container: &'a mut ContainerWriter<W>,
        name: &str,
        codec: CodecCommand,
        checksum: Option<ChecksumSigner>,
    ) -> Result<Self> {
        let codec = match codec {
            CodecCommand::Passthrough => None,
            CodecCommand::External(argv) => Some(PipedCodec::spawn(&argv)?),
        };
        debug!(entry = name, codec = ?codec.as_ref().map(|c| &c.program), "Opening entry");

        let reserved = match container.reserve_header(name) {
            Ok(reserved) => reserved,
            Err(err) => {
                if let Some(codec) = codec {
                    codec.kill();
                }
                return Err(err);
            }
        };

        Ok(Self {
            container,
            reserved: Some(reserved),
            checksum,
            codec,
            done: false,
        })
    }

    fn store(&mut self, data: &[u8]) -> Result<()> {
        self.container.write_data(data)?;
        if let Some(checksum) = &mut self.checksum {
            checksum.update(data)?;
        }
        Ok(())
    }

    /// Move compressor output into the container; blocks until EOF when `wait`.
    fn pump(&mut self, wait: bool) -> Result<()> {
        loop {
            let Some(codec) = &self.codec else {
                return Ok(());
            };
            let next = if wait {
                codec.output.recv().ok()
            } else {
                codec.output.try_recv().ok()
            };
            match next {
                Some(chunk) => self.store(&chunk?)?,
                None => return Ok(()),
            }
        }
    }

    /// Finish the entry: drain and reap the codec, pad, patch the header,
    /// and finalize the checksum sink.
    ///
    /// # Errors
    ///
    /// Returns [`GpkgError::CodecOperationFailed`] if the codec exits
    /// non-success, or any checksum/signing error. The container is marked
    /// aborted on failure.
    pub fn close(mut self) -> Result<WrittenEntry> {
        if let Some(codec) = &mut self.codec {
            drop(codec.stdin.take());
        }
        self.pump(true)?;

        if let Some(mut codec) = self.codec.take() {
            if let Some(reader) = codec.reader.take() {
                reader
                    .join()
                    .map_err(|_| io::Error::other("compressor reader thread panicked"))?;
            }
            let status = codec.child.wait()?;
            if !status.success() {
                return Err(GpkgError::CodecOperationFailed {
                    command: codec.program,
                    status: status.to_string(),
                });
            }
        }

        let reserved = self
            .reserved
            .take()
            .ok_or_else(|| io::Error::other("entry header already finalized"))?;
        let info = self.container.finalize_header(reserved)?;

        let (digests, signature) = match self.checksum.take() {
            Some(checksum) => {
                let outcome = checksum.finish()?;
                (outcome.digests, outcome.signature)
            }
            None => (Vec::new(), None),
        };

        debug!(entry = %info.name, size = info.size, "Closed entry");
        self.done = true;
        Ok(WrittenEntry {
            info,
            digests,
            signature,
        })
    }

    /// Abandon the entry: terminate the codec and mark the container aborted.
    pub fn kill(mut self) {
        if let Some(codec) = self.codec.take() {
            codec.kill();
        }
        self.container.abort();
        self.done = true;
    }
}

impl<W: Write + Seek> Write for EntryWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(codec) = &mut self.codec {
            let stdin = codec
                .stdin
                .as_mut()
                .ok_or_else(|| io::Error::other("compressor input already closed"))?;
            stdin.write_all(buf)?;
            self.pump(false).map_err(io::Error::other)?;
        } else {
            self.store(buf).map_err(io::Error::other)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(codec) = &mut self.codec {
            if let Some(stdin) = &mut codec.stdin {
                stdin.flush()?;
            }
        }
        Ok(())
    }
}

impl<W: Write + Seek> Drop for EntryWriter<'_, W> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Some(codec) = self.codec.take() {
            codec.kill();
        }
        self.container.abort();
    }
}
