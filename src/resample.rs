//! Module B — Resampler (spec §4.B).
//!
//! Lazily spawns an external audio process (`ffmpeg` by default) to convert
//! client PCM to a provider's required sample rate. The process speaks raw
//! signed 16-bit little-endian mono PCM on both stdin and stdout so there is
//! no container framing to negotiate.

use std::process::Stdio;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub const DEFAULT_RESAMPLER_BIN: &str = "ffmpeg";
const READ_CHUNK: usize = 8192;

#[derive(Debug, Error)]
pub enum ResampleError {
    #[error(
        "downsampling {from}Hz -> {to}Hz was requested without a low-pass stage; \
         a naive linear downsample aliases"
    )]
    RejectedNaiveDownsample { from: u32, to: u32 },
    #[error("failed to spawn resampler process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("resampler process exited with status {0}")]
    ProcessExit(i32),
    #[error("resampler stdin/stdout pipe unexpectedly closed")]
    PipeClosed,
}

/// Per-chunk metadata carried alongside PCM through the resampler, so the
/// capture-timestamp attributor downstream still has something to key off.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkMeta {
    pub capture_ts: f64,
    pub duration_ms: f32,
    pub seq: u32,
}

#[derive(Debug, Clone)]
pub struct PcmChunk {
    pub meta: ChunkMeta,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct ResamplerConfig {
    pub from_rate: u32,
    pub to_rate: u32,
    /// Must be true when `to_rate < from_rate`; models a low-pass stage
    /// preceding the naive decimation so aliasing is not introduced
    /// (spec §4.B design invariant).
    pub low_pass: bool,
}

impl ResamplerConfig {
    pub fn validate(&self) -> Result<(), ResampleError> {
        if self.to_rate < self.from_rate && !self.low_pass {
            return Err(ResampleError::RejectedNaiveDownsample {
                from: self.from_rate,
                to: self.to_rate,
            });
        }
        Ok(())
    }
}

/// A running external resampler process. Owns the child's stdin/stdout and
/// a background task draining stdout into `output_rx`; the scoped RAII
/// `Drop` kills the child if it is still alive so a session can never leak
/// an orphaned process on any exit path, including a panic unwind.
pub struct Resampler {
    child: Child,
    stdin: Option<ChildStdin>,
    writer_meta_tx: mpsc::UnboundedSender<ChunkMeta>,
    output_rx: mpsc::Receiver<PcmChunk>,
    reader_task: Option<JoinHandle<Result<i32, ResampleError>>>,
    exit_rx: Option<oneshot::Receiver<i32>>,
}

impl Resampler {
    pub fn spawn(bin: &str, config: ResamplerConfig) -> Result<Self, ResampleError> {
        config.validate()?;

        let mut child = Command::new(bin)
            .args([
                "-f",
                "s16le",
                "-ar",
                &config.from_rate.to_string(),
                "-ac",
                "1",
                "-i",
                "pipe:0",
                "-f",
                "s16le",
                "-ar",
                &config.to_rate.to_string(),
                "-ac",
                "1",
                "-loglevel",
                "error",
                "pipe:1",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdin = child.stdin.take().ok_or(ResampleError::PipeClosed)?;
        let stdout = child.stdout.take().ok_or(ResampleError::PipeClosed)?;

        let (meta_tx, meta_rx) = mpsc::unbounded_channel::<ChunkMeta>();
        let (output_tx, output_rx) = mpsc::channel(64);
        let reader_task = tokio::spawn(drain_stdout(stdout, meta_rx, output_tx));

        Ok(Resampler {
            child,
            stdin: Some(stdin),
            writer_meta_tx: meta_tx,
            output_rx,
            reader_task: Some(reader_task),
            exit_rx: None,
        })
    }

    /// Forward one ingress PCM chunk. The byte-count parity of `payload` is
    /// the caller's (Handler's) responsibility; the resampler only
    /// guarantees alignment on the way *out* (`drain_stdout` below).
    pub async fn write(&mut self, meta: ChunkMeta, payload: &[u8]) -> Result<(), ResampleError> {
        let stdin = self.stdin.as_mut().ok_or(ResampleError::PipeClosed)?;
        // Record the chunk boundary before the bytes so a downstream output
        // read landing just past this write still has a meta to forward.
        self.writer_meta_tx.send(meta).ok();
        stdin.write_all(payload).await?;
        Ok(())
    }

    pub async fn next_output(&mut self) -> Option<PcmChunk> {
        self.output_rx.recv().await
    }

    /// Non-blocking drain of whatever output is already buffered.
    pub fn try_next_output(&mut self) -> Option<PcmChunk> {
        self.output_rx.try_recv().ok()
    }

    /// Close stdin, wait for the process to exit, and surface a non-zero
    /// exit code as fatal (spec §4.B: "a non-zero exit code from the
    /// external process is fatal to the session").
    pub async fn end(mut self) -> Result<(), ResampleError> {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.shutdown().await;
        }
        let status = self.child.wait().await?;
        if let Some(task) = self.reader_task.take() {
            let _ = task.await;
        }
        match status.code() {
            Some(0) | None => Ok(()),
            Some(code) => Err(ResampleError::ProcessExit(code)),
        }
    }
}

impl Drop for Resampler {
    fn drop(&mut self) {
        // Best-effort: if the session is torn down without calling `end()`
        // (error path, panic unwind), make sure the child doesn't outlive us.
        let _ = self.child.start_kill();
    }
}

/// Reads stdout in fixed-size chunks, carrying a single leftover byte
/// across reads so every chunk handed downstream has an even length
/// (spec §4.B alignment invariant), and tags each chunk with the most
/// recently written input chunk's metadata.
async fn drain_stdout(
    mut stdout: ChildStdout,
    mut meta_rx: mpsc::UnboundedReceiver<ChunkMeta>,
    output_tx: mpsc::Sender<PcmChunk>,
) -> Result<i32, ResampleError> {
    let mut carry: Option<u8> = None;
    let mut latest_meta = ChunkMeta {
        capture_ts: 0.0,
        duration_ms: 0.0,
        seq: 0,
    };
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        while let Ok(meta) = meta_rx.try_recv() {
            latest_meta = meta;
        }

        let n = match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };

        let mut payload = Vec::with_capacity(n + 1);
        if let Some(byte) = carry.take() {
            payload.push(byte);
        }
        payload.extend_from_slice(&buf[..n]);

        if payload.len() % 2 != 0 {
            carry = payload.pop();
        }

        if !payload.is_empty()
            && output_tx
                .send(PcmChunk {
                    meta: latest_meta,
                    payload,
                })
                .await
                .is_err()
        {
            break;
        }
    }

    Ok(0)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn upsample_always_allowed() {
        let config = ResamplerConfig {
            from_rate: 16_000,
            to_rate: 24_000,
            low_pass: false,
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn downsample_without_low_pass_rejected() {
        let config = ResamplerConfig {
            from_rate: 48_000,
            to_rate: 16_000,
            low_pass: false,
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ResampleError::RejectedNaiveDownsample { from: 48_000, to: 16_000 }
        ));
    }

    #[test]
    fn downsample_with_low_pass_allowed() {
        let config = ResamplerConfig {
            from_rate: 48_000,
            to_rate: 16_000,
            low_pass: true,
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn same_rate_is_a_degenerate_upsample() {
        let config = ResamplerConfig {
            from_rate: 16_000,
            to_rate: 16_000,
            low_pass: false,
        };
        assert!(config.validate().is_ok());
    }
}
