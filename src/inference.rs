//! Inference bridge: shared rings plus the worker process
//!
//! The pipeline never calls the model directly. Raw frames go into the
//! input ring, an independent worker process annotates them and writes
//! them to the output ring with the frame id preserved, and a consumer
//! task drains the output ring back into the async pipeline.
//!
//! The worker's lifetime is bound to the session: it is spawned at
//! session start and killed (SIGKILL, then reaped) at teardown. An
//! unexpected worker exit is session-fatal; the session tears down and
//! waits for an external restart rather than oscillating.

use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::codec::RawFrame;
use crate::config::Config;
use crate::shm::{FrameShape, ShmError, ShmRing};

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("shared ring error: {0}")]
    Shm(#[from] ShmError),

    #[error("worker process error: {0}")]
    Io(#[from] std::io::Error),
}

/// Produces the segment names for one session's ring pair.
pub fn ring_names(prefix: &str) -> (String, String) {
    let pid = std::process::id();
    (format!("/{prefix}-in-{pid}"), format!("/{prefix}-out-{pid}"))
}

/// The two rings and the worker process serving them.
pub struct InferenceBridge {
    pub input: Arc<ShmRing>,
    pub output: Arc<ShmRing>,
    child: Option<Child>,
}

impl InferenceBridge {
    /// Creates the ring pair and spawns the worker subcommand of the
    /// current executable.
    pub fn spawn(config: &Config) -> Result<Self, InferenceError> {
        let shape = FrameShape::bgr(config.codec.width, config.codec.height);
        let (input_name, output_name) = ring_names(&config.shm.name_prefix);

        let input = Arc::new(ShmRing::create(&input_name, shape, config.shm.capacity)?);
        let output = Arc::new(ShmRing::create(&output_name, shape, config.shm.capacity)?);

        let exe = std::env::current_exe()?;
        let child = Command::new(exe)
            .arg("infer-worker")
            .arg("--input")
            .arg(&input_name)
            .arg("--output")
            .arg(&output_name)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        info!(
            pid = ?child.id(),
            input = %input_name,
            output = %output_name,
            "inference worker spawned"
        );
        Ok(Self {
            input,
            output,
            child: Some(child),
        })
    }

    /// Hands the worker process to a supervisor task. The bridge keeps
    /// only the rings after this.
    pub fn take_child(&mut self) -> Option<Child> {
        self.child.take()
    }

    /// Stops both rings and kills the worker (SIGKILL + reap).
    pub async fn shutdown(&mut self) {
        self.input.stop();
        self.output.stop();
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill inference worker");
            }
            let _ = child.wait().await;
            info!("inference worker stopped");
        }
    }
}

/// Drains the output ring into the async pipeline. Runs on the blocking
/// pool; exits when the ring stops or the channel closes.
pub fn spawn_consumer_task(
    output: Arc<ShmRing>,
    tx: mpsc::Sender<(u32, RawFrame)>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let shape = output.shape();
        loop {
            match output.get() {
                Ok((data, frame_id)) => {
                    let frame = RawFrame::new(shape.width, shape.height, data);
                    if tx.blocking_send((frame_id, frame)).is_err() {
                        break;
                    }
                }
                Err(ShmError::Stopped) => break,
                Err(e) => {
                    error!(error = %e, "output ring read failed");
                    break;
                }
            }
        }
        debug!("inference consumer stopped");
    })
}

/// Per-frame annotation hook. The detection model itself lives behind
/// this seam; the built-in implementation stamps a marker so the output
/// path is exercised end to end.
pub trait Annotator: Send {
    fn annotate(&mut self, frame: &mut [u8], shape: FrameShape, frame_id: u32);
}

/// Draws a small box outline in the top-left corner.
#[derive(Debug, Default)]
pub struct StampAnnotator;

impl Annotator for StampAnnotator {
    fn annotate(&mut self, frame: &mut [u8], shape: FrameShape, _frame_id: u32) {
        let width = shape.width as usize;
        let height = shape.height as usize;
        let channels = shape.channels as usize;
        let (x0, y0, size) = (8usize, 8usize, 16usize);
        if width < x0 + size || height < y0 + size || channels < 3 {
            return;
        }
        let mut paint = |x: usize, y: usize| {
            let i = (y * width + x) * channels;
            // Green in BGR.
            frame[i] = 0;
            frame[i + 1] = 255;
            frame[i + 2] = 0;
        };
        for d in 0..size {
            paint(x0 + d, y0);
            paint(x0 + d, y0 + size - 1);
            paint(x0, y0 + d);
            paint(x0 + size - 1, y0 + d);
        }
    }
}

/// Entry point of the `infer-worker` subcommand: input ring to output
/// ring, frame ids preserved, until either ring stops.
pub fn run_worker(input_name: &str, output_name: &str) -> Result<(), InferenceError> {
    let input = ShmRing::open(input_name)?;
    let output = ShmRing::open(output_name)?;
    let shape = input.shape();
    let mut annotator = StampAnnotator;

    info!(input = input_name, output = output_name, "inference worker running");
    loop {
        let (mut frame, frame_id) = match input.get() {
            Ok(pair) => pair,
            Err(ShmError::Stopped) => break,
            Err(e) => return Err(e.into()),
        };
        annotator.annotate(&mut frame, shape, frame_id);
        match output.put(&frame, frame_id) {
            Ok(()) => {}
            Err(ShmError::Stopped) => break,
            Err(e) => return Err(e.into()),
        }
    }
    info!("inference worker exiting");
    Ok(())
}
