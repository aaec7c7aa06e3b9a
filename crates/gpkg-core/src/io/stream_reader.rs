//! Reads one entry back out, optionally through an external decompressor.
//!
//! A feeder thread copies the compressed source into the decompressor's
//! stdin while the caller reads decoded bytes from its stdout. Writing the
//! whole payload before reading would deadlock as soon as both pipe buffers
//! fill.

use std::io::{self, Read, Write};
use std::process::{Child, ChildStdout};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use tracing::debug;

use crate::config::CodecCommand;
use crate::error::{GpkgError, Result};
use crate::io::{PIPE_CHUNK, spawn_codec};

struct Piped {
    program: String,
    child: Child,
    stdout: ChildStdout,
    feeder: Option<JoinHandle<io::Result<()>>>,
    killed: Arc<AtomicBool>,
}

enum Source<R> {
    Direct(R),
    Piped(Piped),
}

/// Reader for a single entry's (decoded) content.
///
/// Must end in [`close`](Self::close) or [`kill`](Self::kill); dropping it
/// otherwise kills the decompressor.
pub struct EntryReader<R: Read + Send + 'static> {
    source: Option<Source<R>>,
}

impl<R: Read + Send + 'static> std::fmt::Debug for EntryReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let codec = match &self.source {
            Some(Source::Piped(piped)) => Some(piped.program.as_str()),
            _ => None,
        };
        f.debug_struct("EntryReader").field("codec", &codec).finish()
    }
}

impl<R: Read + Send + 'static> EntryReader<R> {
    /// Wrap `source`, starting the decompressor and feeder thread if a codec is given.
    ///
    /// # Errors
    ///
    /// Returns [`GpkgError::UnsupportedCodec`] if the decompressor cannot be started.
    pub fn open(source: R, codec: CodecCommand) -> Result<Self> {
        let argv = match codec {
            CodecCommand::Passthrough => {
                return Ok(Self {
                    source: Some(Source::Direct(source)),
                });
            }
            CodecCommand::External(argv) => argv,
        };

        let (mut child, program) = spawn_codec(&argv)?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let (Some(mut stdin), Some(stdout)) = (stdin, stdout) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(io::Error::other("decompressor pipes were not captured").into());
        };

        let killed = Arc::new(AtomicBool::new(false));
        let feeder_killed = Arc::clone(&killed);
        let mut source = source;
        let feeder = thread::spawn(move || -> io::Result<()> {
            let mut buf = vec![0u8; PIPE_CHUNK];
            loop {
                let n = match source.read(&mut buf) {
                    Ok(0) => return Ok(()),
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                };
                if let Err(e) = stdin.write_all(&buf[..n]) {
                    if e.kind() == io::ErrorKind::BrokenPipe && feeder_killed.load(Ordering::SeqCst)
                    {
                        return Ok(());
                    }
                    return Err(e);
                }
            }
        });

        debug!(codec = %program, "Started decompressor");
        Ok(Self {
            source: Some(Source::Piped(Piped {
                program,
                child,
                stdout,
                feeder: Some(feeder),
                killed,
            })),
        })
    }

    /// Drain any unread output, join the feeder and check the decompressor's exit.
    ///
    /// # Errors
    ///
    /// Returns [`GpkgError::CodecOperationFailed`] on a non-success exit, or
    /// the feeder thread's I/O error.
    pub fn close(mut self) -> Result<()> {
        let Some(Source::Piped(mut piped)) = self.source.take() else {
            return Ok(());
        };

        io::copy(&mut piped.stdout, &mut io::sink())?;
        let status = piped.child.wait()?;
        let fed = match piped.feeder.take() {
            Some(feeder) => feeder
                .join()
                .map_err(|_| io::Error::other("decompressor feeder thread panicked"))?,
            None => Ok(()),
        };

        if !status.success() {
            return Err(GpkgError::CodecOperationFailed {
                command: piped.program,
                status: status.to_string(),
            });
        }
        fed?;
        Ok(())
    }

    /// Abandon the read: terminate the decompressor and ignore the resulting broken pipe.
    pub fn kill(mut self) {
        if let Some(Source::Piped(piped)) = self.source.take() {
            kill_piped(piped);
        }
    }
}

fn kill_piped(mut piped: Piped) {
    piped.killed.store(true, Ordering::SeqCst);
    let _ = piped.child.kill();
    let _ = piped.child.wait();
    if let Some(feeder) = piped.feeder.take() {
        let _ = feeder.join();
    }
}

impl<R: Read + Send + 'static> Read for EntryReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.source {
            Some(Source::Direct(source)) => source.read(buf),
            Some(Source::Piped(piped)) => piped.stdout.read(buf),
            None => Ok(0),
        }
    }
}

impl<R: Read + Send + 'static> Drop for EntryReader<R> {
    fn drop(&mut self) {
        if let Some(Source::Piped(piped)) = self.source.take() {
            kill_piped(piped);
        }
    }
}
