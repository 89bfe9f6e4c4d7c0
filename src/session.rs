// Session host: one render instance per connected client
//
// Each session runs its own engine on a dedicated thread. The client side
// keeps a SessionHandle to push transform updates and to stop the thread.
// A failing session logs, closes its sink and ends; other sessions and the
// process keep running.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crate::backend::{Adapter, DeviceContext};
use crate::config::Config;
use crate::engine::Engine;
use crate::readback::MappedFrame;
use crate::scene::DrawSet;
use crate::transform::{TransformDelta, TransformHandle};

/// Why a sink stopped receiving frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The session was stopped
    Finished,
    /// The render instance hit an error; the message is the full error chain
    Failed(String),
}

/// Consumer of captured frames (encoder, network writer, ...)
pub trait FrameSink: Send + 'static {
    /// Called on the render thread for every capture. The frame is only
    /// valid for the duration of the call; an error ends the session.
    fn deliver(&mut self, frame: &MappedFrame) -> Result<()>;

    /// Called exactly once when the session ends
    fn close(&mut self, reason: CloseReason);
}

/// Spawns render sessions sharing one adapter
pub struct SessionHost {
    adapter: Arc<Adapter>,
    shared_ctx: Option<Arc<DeviceContext>>,
    config: Arc<Config>,
    scene: Arc<DrawSet>,
    next_id: AtomicU64,
}

impl SessionHost {
    /// With `session.multi_instance` every session creates its own logical
    /// device; otherwise all sessions share one created here.
    pub fn new(adapter: Arc<Adapter>, config: Config, scene: DrawSet) -> Result<Self> {
        config.validate()?;
        scene.validate()?;

        let shared_ctx = if config.session.multi_instance {
            None
        } else {
            Some(DeviceContext::new(adapter.clone(), config.device.use_transfer_queue)?)
        };

        Ok(Self {
            adapter,
            shared_ctx,
            config: Arc::new(config),
            scene: Arc::new(scene),
            next_id: AtomicU64::new(1),
        })
    }

    /// Start a render thread feeding `sink`
    pub fn open<S: FrameSink>(&self, sink: S) -> Result<SessionHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let transform = TransformHandle::default();
        let stop = Arc::new(AtomicBool::new(false));

        let worker = SessionWorker {
            id,
            adapter: self.adapter.clone(),
            shared_ctx: self.shared_ctx.clone(),
            config: self.config.clone(),
            scene: self.scene.clone(),
            transform: transform.clone(),
            stop: stop.clone(),
        };

        let thread = std::thread::Builder::new()
            .name(format!("render-session-{}", id))
            .spawn(move || worker.run(sink))
            .context("Failed to spawn render thread")?;

        log::info!("Opened session {}", id);
        Ok(SessionHandle {
            id,
            transform,
            stop,
            thread: Some(thread),
        })
    }
}

/// Client-side view of a running session
pub struct SessionHandle {
    id: u64,
    transform: TransformHandle,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<u64>>,
}

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Apply a client transform update; picked up by the next frame
    pub fn apply(&self, delta: &TransformDelta) {
        self.transform.apply(delta);
    }

    pub fn transform(&self) -> &TransformHandle {
        &self.transform
    }

    /// True once the render thread has exited (stopped or failed)
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Stop the render thread and wait for it. Returns the number of frames
    /// delivered.
    pub fn stop_and_join(mut self) -> Result<u64> {
        self.stop.store(true, Ordering::Relaxed);
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| anyhow::anyhow!("render thread of session {} panicked", self.id)),
            None => Ok(0),
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct SessionWorker {
    id: u64,
    adapter: Arc<Adapter>,
    shared_ctx: Option<Arc<DeviceContext>>,
    config: Arc<Config>,
    scene: Arc<DrawSet>,
    transform: TransformHandle,
    stop: Arc<AtomicBool>,
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

impl SessionWorker {
    fn run<S: FrameSink>(self, mut sink: S) -> u64 {
        let mut delivered = 0;
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.render_loop(&mut sink, &mut delivered)
        }))
        .unwrap_or_else(|payload| {
            Err(anyhow::anyhow!("render thread panicked: {}", panic_message(&*payload)))
        });

        match result {
            Ok(()) => {
                log::info!("Session {} finished after {} frames", self.id, delivered);
                sink.close(CloseReason::Finished);
            }
            Err(e) => {
                log::error!("Session {} failed: {:#}", self.id, e);
                sink.close(CloseReason::Failed(format!("{:#}", e)));
            }
        }
        delivered
    }

    fn render_loop<S: FrameSink>(&self, sink: &mut S, delivered: &mut u64) -> Result<()> {
        let ctx = match &self.shared_ctx {
            Some(ctx) => ctx.clone(),
            None => {
                DeviceContext::new(self.adapter.clone(), self.config.device.use_transfer_queue)?
            }
        };

        let mut engine =
            Engine::with_transform(ctx, &self.scene, &self.config, self.transform.clone())
                .with_context(|| format!("Failed to build engine for session {}", self.id))?;
        let idle_backoff = self.config.session.idle_backoff();

        while !self.stop.load(Ordering::Relaxed) {
            match engine.tick(Instant::now())? {
                Some(frame) => {
                    sink.deliver(&frame).context("Frame sink rejected a frame")?;
                    *delivered += 1;
                }
                None => {
                    if !idle_backoff.is_zero() {
                        std::thread::sleep(idle_backoff);
                    }
                }
            }
        }
        Ok(())
    }
}
