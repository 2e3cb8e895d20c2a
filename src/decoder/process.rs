use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use encoding_rs::UTF_8;
use tracing::{debug, info, warn};

use super::protocol::{deserialize_response, serialize_request};
use super::BridgeError;
use crate::ir::{ScoreEntry, Sentence, Word};

const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const EXIT_POLL: Duration = Duration::from_millis(20);

/// How to launch a decoder process; starting it yields a running [`DecoderProcess`].
#[derive(Clone, Debug)]
pub struct DecoderCommand {
    pub program: String,
    pub args: Vec<String>,
    pub home: PathBuf,
    pub model: PathBuf,
    pub shutdown_grace: Duration,
}

impl DecoderCommand {
    pub fn new(home: impl Into<PathBuf>, model: impl Into<PathBuf>) -> Self {
        Self {
            program: "python".to_string(),
            args: vec!["nmt_decoder.py".to_string()],
            home: home.into(),
            model: model.into(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    pub fn program(mut self, program: impl Into<String>, args: Vec<String>) -> Self {
        self.program = program.into();
        self.args = args;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Launches the process on the zero-based `gpu`, or on CPU when `None`.
    pub fn start(&self, gpu: Option<usize>) -> Result<DecoderProcess, BridgeError> {
        let model = absolute(&self.model);
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(&model)
            .current_dir(&self.home)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(gpu) = gpu {
            // The decoder counts devices from 1.
            cmd.arg("--gpu-index").arg((gpu + 1).to_string());
        }

        let mut child = cmd.spawn().map_err(|source| BridgeError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(BridgeError::Spawn {
                program: self.program.clone(),
                source: std::io::Error::other("decoder stdio not captured"),
            });
        };
        info!(pid = child.id(), ?gpu, model = %model.display(), "decoder process started");

        Ok(DecoderProcess {
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
            shutdown_grace: self.shutdown_grace,
            closed: false,
        })
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// One running decoder process. Serves one request at a time; callers that
/// share it must serialize access.
pub struct DecoderProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    shutdown_grace: Duration,
    closed: bool,
}

impl DecoderProcess {
    #[must_use]
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn is_alive(&mut self) -> bool {
        !self.closed && matches!(self.child.try_wait(), Ok(None))
    }

    /// Sends one request line and blocks for exactly one response line.
    pub fn translate(
        &mut self,
        sentence: &Sentence,
        suggestions: Option<&[ScoreEntry]>,
    ) -> Result<Vec<Word>, BridgeError> {
        if !self.is_alive() {
            return Err(BridgeError::Rejected);
        }
        let stdin = self.stdin.as_mut().ok_or(BridgeError::Rejected)?;

        let payload = serialize_request(sentence, suggestions)?;
        stdin
            .write_all(payload.as_bytes())
            .and_then(|_| stdin.write_all(b"\n"))
            .and_then(|_| stdin.flush())
            .map_err(BridgeError::Send)?;

        let mut buf: Vec<u8> = Vec::new();
        self.stdout
            .read_until(b'\n', &mut buf)
            .map_err(BridgeError::Receive)?;
        let (line, _) = UTF_8.decode_without_bom_handling(&buf);
        let line = line.trim();
        if line.is_empty() {
            return Err(BridgeError::NoResponse { request: payload });
        }
        deserialize_response(line)
    }

    /// Asks the process to exit by closing its input, waits out the grace
    /// period, then kills it. Never fails.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let pid = self.child.id();
        drop(self.stdin.take());

        if !wait_for_exit(&mut self.child, self.shutdown_grace) {
            warn!(pid, grace_ms = self.shutdown_grace.as_millis() as u64, "decoder still alive, killing");
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
        debug!(pid, "decoder process closed");
    }
}

impl Drop for DecoderProcess {
    fn drop(&mut self) {
        self.close();
    }
}

fn wait_for_exit(child: &mut Child, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) => {}
            Err(_) => return false,
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(EXIT_POLL);
    }
}
