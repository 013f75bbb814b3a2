//! The render thread: sole owner of the GPU context and the compositor.
//!
//! Everything else talks to it through [`RenderClient`], which sends
//! [`RenderCommand`]s over a bounded channel. Readiness is reported once the
//! GPU context and compositor exist.

use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};

use crate::audio::points::BeamFrame;
use crate::worker::PointSink;

use super::compositor::{Compositor, CompositorConfig};
use super::context::GpuContext;
use super::params::SharedRenderParameters;
use super::sink::FrameSink;
use super::textures::CapturedFrame;

/// Commands the render thread accepts.
pub enum RenderCommand {
    /// Render one frame. With a reply channel, the output is read back and
    /// sent; `None` is sent when the frame was skipped.
    Frame {
        frame: BeamFrame,
        reply: Option<Sender<Option<CapturedFrame>>>,
    },
    Reconfigure(CompositorConfig),
    /// Pin the output to a resolution, or unpin with `None`.
    LockResolution(Option<u32>),
    AddSink(Box<dyn FrameSink>),
    Shutdown,
}

/// Render thread start-up state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Pending,
    /// Carries the adapter name.
    Ready(String),
    Failed(String),
}

/// Why a synchronous render request produced no frame.
#[derive(Debug, thiserror::Error)]
pub enum RenderRequestError {
    #[error("Render thread is not running")]
    NotRunning,
    #[error("Render thread did not answer within {0:?}")]
    Timeout(Duration),
    #[error("Frame was skipped after a GPU error")]
    Skipped,
}

/// Handle for sending work to the render thread. Cheap to clone.
#[derive(Clone)]
pub struct RenderClient {
    commands: Sender<RenderCommand>,
    params: Arc<SharedRenderParameters>,
}

impl RenderClient {
    /// A client whose commands go to the returned receiver instead of a
    /// render thread.
    #[cfg(test)]
    pub(crate) fn detached(params: Arc<SharedRenderParameters>) -> (Self, Receiver<RenderCommand>) {
        let (commands, receiver) = channel::unbounded();
        (Self { commands, params }, receiver)
    }

    pub fn parameters(&self) -> &Arc<SharedRenderParameters> {
        &self.params
    }

    /// Queue a frame for display without waiting. Returns false when the
    /// thread is busy or gone.
    pub fn submit(&self, frame: BeamFrame) -> bool {
        match self.commands.try_send(RenderCommand::Frame { frame, reply: None }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Render a frame and wait for its pixels.
    pub fn render(
        &self,
        frame: BeamFrame,
        timeout: Duration,
    ) -> Result<CapturedFrame, RenderRequestError> {
        let (reply, response) = channel::bounded(1);
        let command = RenderCommand::Frame {
            frame,
            reply: Some(reply),
        };
        match self.commands.send_timeout(command, timeout) {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => return Err(RenderRequestError::Timeout(timeout)),
            Err(SendTimeoutError::Disconnected(_)) => return Err(RenderRequestError::NotRunning),
        }
        match response.recv_timeout(timeout) {
            Ok(Some(captured)) => Ok(captured),
            Ok(None) => Err(RenderRequestError::Skipped),
            Err(RecvTimeoutError::Timeout) => Err(RenderRequestError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(RenderRequestError::NotRunning),
        }
    }

    pub fn reconfigure(&self, config: CompositorConfig) -> Result<(), RenderRequestError> {
        self.send(RenderCommand::Reconfigure(config))
    }

    pub fn lock_resolution(&self, resolution: Option<u32>) -> Result<(), RenderRequestError> {
        self.send(RenderCommand::LockResolution(resolution))
    }

    pub fn add_sink(&self, sink: Box<dyn FrameSink>) -> Result<(), RenderRequestError> {
        self.send(RenderCommand::AddSink(sink))
    }

    fn send(&self, command: RenderCommand) -> Result<(), RenderRequestError> {
        self.commands
            .send(command)
            .map_err(|_| RenderRequestError::NotRunning)
    }
}

impl PointSink for RenderClient {
    fn submit(&mut self, frame: BeamFrame) -> bool {
        RenderClient::submit(self, frame)
    }
}

/// A running render thread. Shuts the thread down on drop.
pub struct RenderThread {
    client: RenderClient,
    ready: Receiver<Result<String, String>>,
    readiness: OnceLock<Readiness>,
    thread: Option<JoinHandle<()>>,
}

impl RenderThread {
    /// Spawn the thread. GPU initialisation happens on the new thread;
    /// use [`RenderThread::poll_ready`] to learn when it finished.
    pub fn spawn(
        params: Arc<SharedRenderParameters>,
        config: CompositorConfig,
    ) -> std::io::Result<Self> {
        // One frame in flight plus one queued.
        let (commands, receiver) = channel::bounded(2);
        let (ready_tx, ready) = channel::bounded(1);
        let thread_params = Arc::clone(&params);

        let thread = thread::Builder::new()
            .name("render".to_string())
            .spawn(move || run(thread_params, config, receiver, ready_tx))?;

        Ok(Self {
            client: RenderClient { commands, params },
            ready,
            readiness: OnceLock::new(),
            thread: Some(thread),
        })
    }

    pub fn client(&self) -> RenderClient {
        self.client.clone()
    }

    /// Wait up to `timeout` for the start-up result. Once known, the result
    /// is returned immediately on every later call.
    pub fn poll_ready(&self, timeout: Duration) -> Readiness {
        if let Some(state) = self.readiness.get() {
            return state.clone();
        }
        let state = match self.ready.recv_timeout(timeout) {
            Ok(Ok(adapter)) => Readiness::Ready(adapter),
            Ok(Err(message)) => Readiness::Failed(message),
            Err(RecvTimeoutError::Timeout) => return Readiness::Pending,
            Err(RecvTimeoutError::Disconnected) => {
                Readiness::Failed("render thread exited during start-up".to_string())
            }
        };
        self.readiness.get_or_init(|| state).clone()
    }

    /// Stop the thread and wait for it.
    pub fn shutdown(&mut self) {
        let _ = self.client.commands.send(RenderCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Render thread panicked");
            }
        }
    }
}

impl Drop for RenderThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(
    params: Arc<SharedRenderParameters>,
    config: CompositorConfig,
    commands: Receiver<RenderCommand>,
    ready: Sender<Result<String, String>>,
) {
    let ctx = match GpuContext::new_blocking() {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => {
            log::error!("Render thread could not start: {e}");
            let _ = ready.send(Err(e.to_string()));
            return;
        }
    };
    let adapter = ctx.adapter_info().name;
    let mut compositor = Compositor::new(ctx, &params.snapshot(), config);
    let mut sinks: Vec<Box<dyn FrameSink>> = Vec::new();
    let _ = ready.send(Ok(adapter));
    log::info!("Render thread ready");

    for command in commands.iter() {
        match command {
            RenderCommand::Frame { frame, reply } => {
                let snapshot = params.snapshot();
                let result =
                    compositor.render_frame(&frame, &snapshot, &mut sinks, reply.is_some());
                let captured = match result {
                    Ok(rendered) => rendered.captured,
                    Err(e) => {
                        log::warn!("Skipped frame {}: {e}", frame.sequence);
                        None
                    }
                };
                if let Some(reply) = reply {
                    let _ = reply.send(captured);
                }
                sinks.retain(|sink| {
                    if sink.is_closed() {
                        log::debug!("Removing closed {} sink", sink.name());
                    }
                    !sink.is_closed()
                });
            }
            RenderCommand::Reconfigure(config) => compositor.reconfigure(config),
            RenderCommand::LockResolution(resolution) => {
                log::debug!("Resolution lock: {resolution:?}");
                compositor.lock_resolution(resolution);
            }
            RenderCommand::AddSink(sink) => {
                log::debug!("Adding {} sink", sink.name());
                sinks.push(sink);
            }
            RenderCommand::Shutdown => break,
        }
    }
    log::info!("Render thread stopped after {} frames", compositor.frames_rendered());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::points::BeamPoint;
    use crate::gpu::params::RenderParameters;

    fn ready_thread(resolution: u32) -> Option<RenderThread> {
        let params = RenderParameters {
            resolution,
            ..Default::default()
        };
        let shared = Arc::new(SharedRenderParameters::new(&params));
        let thread = RenderThread::spawn(shared, CompositorConfig::default()).ok()?;
        loop {
            match thread.poll_ready(Duration::from_millis(100)) {
                Readiness::Pending => continue,
                Readiness::Ready(_) => return Some(thread),
                Readiness::Failed(_) => return None,
            }
        }
    }

    #[test]
    fn test_render_returns_frame_of_requested_size() {
        let Some(thread) = ready_thread(128) else {
            return;
        };
        let client = thread.client();
        let frame = BeamFrame {
            points: vec![BeamPoint::new(-0.5, 0.0), BeamPoint::new(0.5, 0.0)],
            point_rate: 192_000.0,
            sequence: 3,
        };
        let captured = client.render(frame, Duration::from_secs(10)).unwrap();
        assert_eq!((captured.width, captured.height), (128, 128));
        assert_eq!(captured.pixels.len(), 128 * 128 * 4);
        assert_eq!(captured.sequence, 3);
    }

    #[test]
    fn test_lock_resolution_ignores_parameter_changes() {
        let Some(thread) = ready_thread(128) else {
            return;
        };
        let client = thread.client();
        client.lock_resolution(Some(64)).unwrap();
        client.parameters().set_resolution(256);

        let captured = client
            .render(BeamFrame::default(), Duration::from_secs(10))
            .unwrap();
        assert_eq!(captured.width, 64);

        client.lock_resolution(None).unwrap();
        let captured = client
            .render(BeamFrame::default(), Duration::from_secs(10))
            .unwrap();
        assert_eq!(captured.width, 256);
    }

    #[test]
    fn test_requests_fail_after_shutdown() {
        let Some(mut thread) = ready_thread(64) else {
            return;
        };
        let client = thread.client();
        thread.shutdown();
        assert!(matches!(
            client.render(BeamFrame::default(), Duration::from_millis(200)),
            Err(RenderRequestError::NotRunning)
        ));
        assert!(!client.submit(BeamFrame::default()));
    }
}
