//! Descriptor extraction by an external program.
//!
//! The program receives the image bytes on stdin and `--all` as its last
//! argument, and prints a JSON array of descriptors (one array of floats per
//! detected face, in detection order) on stdout.
//!
//! Each run has a deadline. A program still running when it passes is killed
//! together with anything it spawned, so a hung run frees its worker.

use facevote_core::{Descriptor, DescriptorExtractor, ExtractorError};
use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;
use wait_timeout::ChildExt;

pub struct CommandExtractor {
    program: String,
    args: Vec<String>,
    dimension: usize,
    timeout: Duration,
}

impl CommandExtractor {
    /// Build from a whitespace-separated command line.
    pub fn new(
        command_line: &str,
        dimension: usize,
        timeout: Duration,
    ) -> Result<Self, ExtractorError> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| ExtractorError::Failed("empty extractor command".into()))?;
        let args = parts.collect();

        tracing::info!(program = %program, dimension, ?timeout, "command extractor configured");
        Ok(Self {
            program,
            args,
            dimension,
            timeout,
        })
    }

    fn spawn(&self) -> Result<Child, ExtractorError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg("--all")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group, so a timeout can take down helpers it forks.
            command.process_group(0);
        }
        command
            .spawn()
            .map_err(|e| ExtractorError::Failed(format!("spawning {}: {e}", self.program)))
    }

    /// Wait for `child` until the deadline; kill it once the deadline passes.
    fn wait(&self, child: &mut Child) -> Result<ExitStatus, ExtractorError> {
        match child.wait_timeout(self.timeout) {
            Ok(Some(status)) => Ok(status),
            Ok(None) => {
                tracing::warn!(
                    program = %self.program,
                    timeout = ?self.timeout,
                    "extractor timed out; killing"
                );
                terminate(child);
                Err(ExtractorError::Timeout(self.timeout))
            }
            Err(e) => {
                terminate(child);
                Err(ExtractorError::Failed(format!("waiting for extractor: {e}")))
            }
        }
    }
}

impl DescriptorExtractor for CommandExtractor {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn extract_all(&self, image: &[u8]) -> Result<Vec<Descriptor>, ExtractorError> {
        let format =
            image::guess_format(image).map_err(|e| ExtractorError::InvalidImage(e.to_string()))?;
        tracing::trace!(?format, bytes = image.len(), "running extractor");

        let mut child = self.spawn()?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Pipes are serviced on their own threads so a child that stops
        // reading or writing cannot stall the deadline.
        let (status, written, stdout, stderr) = std::thread::scope(|s| {
            let writer = s.spawn(move || match stdin {
                Some(mut pipe) => pipe.write_all(image),
                None => Ok(()),
            });
            let out = s.spawn(move || drain(stdout));
            let err = s.spawn(move || drain(stderr));

            let status = self.wait(&mut child);
            (status, joined(writer), joined(out), joined(err))
        });

        let status = status?;
        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr.unwrap_or_default()).into_owned();
            return Err(ExtractorError::Failed(format!(
                "extractor exited with {status}: {}",
                stderr.trim()
            )));
        }
        written.map_err(|e| ExtractorError::Failed(format!("writing image to extractor: {e}")))?;
        let stdout =
            stdout.map_err(|e| ExtractorError::Failed(format!("reading extractor output: {e}")))?;

        parse_descriptors(&stdout, self.dimension)
    }
}

/// Kill the child's process group (or just the child off unix) and reap it.
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if let Err(e) = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL) {
            tracing::debug!(error = %e, "killpg on extractor failed");
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

fn drain(pipe: Option<impl Read>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf)?;
    }
    Ok(buf)
}

fn joined<T>(handle: std::thread::ScopedJoinHandle<'_, std::io::Result<T>>) -> std::io::Result<T> {
    handle
        .join()
        .unwrap_or_else(|_| Err(std::io::Error::other("extractor pipe thread panicked")))
}

fn parse_descriptors(stdout: &[u8], dimension: usize) -> Result<Vec<Descriptor>, ExtractorError> {
    let faces: Vec<Vec<f32>> = serde_json::from_slice(stdout)
        .map_err(|e| ExtractorError::Failed(format!("unparsable extractor output: {e}")))?;

    if let Some((i, face)) = faces.iter().enumerate().find(|(_, f)| f.len() != dimension) {
        return Err(ExtractorError::Failed(format!(
            "face {i}: expected {dimension}-dim descriptor, got {}",
            face.len()
        )));
    }

    Ok(faces.into_iter().map(Descriptor::new).collect())
}
