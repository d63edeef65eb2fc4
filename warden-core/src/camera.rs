//! Camera worker: owns one video stream end to end.
//!
//! The worker cycles `Connecting → Streaming → Recovering → Connecting` until
//! cancelled. Transient read/decode failures are counted and ridden out;
//! after `max_consecutive_failures` the capture is dropped and reopened with
//! exponential backoff. Frames are paced *before* detection: once a frame
//! enters the pipeline its result always reaches the tracker.
//!
//! The stream itself is abstracted behind [`VideoSource`] /
//! [`VideoSourceFactory`] so the worker logic runs identically over RTSP and
//! over scripted sources in tests.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use warden_types::{CamId, CameraParams, Frame};

use crate::pipeline::CameraPipeline;
use crate::Result;

/// Cap for the exponential reconnect backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// A live, opened video capture.
pub trait VideoSource: Send {
    /// Read and decode the next frame. Errors are treated as transient by
    /// the worker; a bounded number of them in a row recycles the capture.
    fn read_frame(&mut self) -> impl Future<Output = Result<Frame>> + Send;
}

/// Opens fresh captures, once per (re)connect.
pub trait VideoSourceFactory: Send {
    type Source: VideoSource;
    fn open(&self) -> impl Future<Output = Result<Self::Source>> + Send;
}

/// Camera worker connection state, observable through a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Disconnected,
    Connecting,
    Streaming,
    Recovering,
}

pub struct CameraWorker<F: VideoSourceFactory> {
    camera: CamId,
    factory: F,
    pipeline: CameraPipeline,
    params: CameraParams,
    state_tx: tokio::sync::watch::Sender<WorkerState>,
}

impl<F: VideoSourceFactory> CameraWorker<F> {
    pub fn new(factory: F, pipeline: CameraPipeline, params: CameraParams) -> Self {
        let (state_tx, _) = tokio::sync::watch::channel(WorkerState::Disconnected);
        Self {
            camera: pipeline.camera(),
            factory,
            pipeline,
            params,
            state_tx,
        }
    }

    /// Observe the worker's connection state.
    pub fn state_rx(&self) -> tokio::sync::watch::Receiver<WorkerState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: WorkerState) {
        let _ = self.state_tx.send(state);
    }

    /// Run until cancelled. On cancellation the capture is released and all
    /// of this camera's bindings are flushed to the resolver.
    pub async fn run(mut self, cancel: CancellationToken) {
        let open_timeout = Duration::from_millis(self.params.open_timeout_ms);
        let read_timeout = Duration::from_millis(self.params.read_timeout_ms);
        // Non-positive target_fps disables pacing.
        let min_frame_interval = if self.params.target_fps > 0.0 {
            Some(Duration::from_secs_f32(1.0 / self.params.target_fps))
        } else {
            None
        };
        let mut backoff = Duration::from_secs(1);

        'reconnect: while !cancel.is_cancelled() {
            self.set_state(WorkerState::Connecting);
            debug!(camera = %self.camera, "connecting");

            let opened = tokio::select! {
                _ = cancel.cancelled() => break 'reconnect,
                r = tokio::time::timeout(open_timeout, self.factory.open()) => r,
            };
            let mut source = match opened {
                Ok(Ok(source)) => source,
                Ok(Err(e)) => {
                    warn!(camera = %self.camera, "connect failed ({e}); retrying in {backoff:?}");
                    tokio::select! {
                        _ = cancel.cancelled() => break 'reconnect,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue 'reconnect;
                }
                Err(_) => {
                    warn!(camera = %self.camera, "connect timed out; retrying in {backoff:?}");
                    tokio::select! {
                        _ = cancel.cancelled() => break 'reconnect,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue 'reconnect;
                }
            };

            backoff = Duration::from_secs(1);
            self.set_state(WorkerState::Streaming);
            info!(camera = %self.camera, "streaming");

            let mut consecutive_failures = 0u32;
            let mut last_processed: Option<Instant> = None;
            let mut last_frame_index: Option<u64> = None;

            loop {
                let read = tokio::select! {
                    _ = cancel.cancelled() => break 'reconnect,
                    r = tokio::time::timeout(read_timeout, source.read_frame()) => r,
                };

                let frame = match read {
                    Ok(Ok(frame)) => frame,
                    Ok(Err(e)) => {
                        consecutive_failures += 1;
                        debug!(
                            camera = %self.camera,
                            consecutive_failures,
                            "recoverable read failure: {e}"
                        );
                        if consecutive_failures >= self.params.max_consecutive_failures {
                            warn!(camera = %self.camera, "too many read failures; recycling capture");
                            self.set_state(WorkerState::Recovering);
                            drop(source);
                            continue 'reconnect;
                        }
                        continue;
                    }
                    Err(_) => {
                        consecutive_failures += 1;
                        debug!(camera = %self.camera, consecutive_failures, "frame read timed out");
                        if consecutive_failures >= self.params.max_consecutive_failures {
                            warn!(camera = %self.camera, "too many read timeouts; recycling capture");
                            self.set_state(WorkerState::Recovering);
                            drop(source);
                            continue 'reconnect;
                        }
                        continue;
                    }
                };

                consecutive_failures = 0;

                // Frames handed downstream must carry monotonic indices
                // within one capture session.
                if let Some(last) = last_frame_index {
                    if frame.frame_index <= last {
                        debug!(
                            camera = %self.camera,
                            frame_index = frame.frame_index,
                            "dropping out-of-order frame"
                        );
                        continue;
                    }
                }
                last_frame_index = Some(frame.frame_index);

                // Pacing drops happen before detection, never after.
                if let (Some(interval), Some(last)) = (min_frame_interval, last_processed) {
                    if last.elapsed() < interval {
                        continue;
                    }
                }
                last_processed = Some(Instant::now());

                self.pipeline.process_frame(&frame);
            }
        }

        // Wind-down: release the capture (dropped with the loop scope) and
        // clear every binding this camera owns.
        self.set_state(WorkerState::Disconnected);
        self.pipeline.flush();
        info!(camera = %self.camera, "camera worker stopped");
    }
}
