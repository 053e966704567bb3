//! Live webcam sessions with a bounded proof recording.
//!
//! Each connection owns at most one session. A session runs a frame loop that
//! pushes every frame to the operator and buffers those captured inside the proof
//! window, plus a deadline task that saves the window once it closes. Saving is
//! single-assignment under the session lock: whichever of the deadline and an
//! explicit stop gets there first writes the clip, the other sees the result.
//! A device that stops producing ends its session the same way a stop does.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::connection::ConnectionId;

use super::camera::{CameraLease, CameraSlot};
use super::proof_store::{ProofMeta, ProofStore};

pub type FrameSink = Arc<dyn Fn(&[u8]) + Send + Sync>;
pub type ProofSink = Arc<dyn Fn(&ProofMeta) + Send + Sync>;

pub const MAX_FPS: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Opening,
    Live,
    Stopping,
}

struct SessionCore {
    phase: Phase,
    /// `Some` once the window has been finalised; the inner value is the saved clip, if any.
    saved: Option<Option<ProofMeta>>,
}

#[derive(Default)]
struct FrameBuffer {
    frames: Vec<Vec<u8>>,
    sealed: bool,
}

struct WebcamSession {
    core: tokio::sync::Mutex<SessionCore>,
    buffer: Mutex<FrameBuffer>,
    started_at: Mutex<Instant>,
    window: Duration,
    stop: CancelToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebcamSession {
    fn new(window: Duration) -> Self {
        Self {
            core: tokio::sync::Mutex::new(SessionCore { phase: Phase::Opening, saved: None }),
            buffer: Mutex::new(FrameBuffer::default()),
            started_at: Mutex::new(Instant::now()),
            window,
            stop: CancelToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn elapsed(&self) -> Duration { self.started_at.lock().elapsed() }

    fn record(&self, frame: &[u8]) {
        if self.elapsed() > self.window { return; }
        let mut buf = self.buffer.lock();
        if !buf.sealed { buf.frames.push(frame.to_vec()); }
    }

    /// Persist the buffered window at most once. Returns the clip and whether this call saved it.
    async fn save_once(&self, store: &Arc<ProofStore>) -> (Option<ProofMeta>, bool) {
        let mut core = self.core.lock().await;
        if let Some(done) = core.saved.as_ref() { return (done.clone(), false); }

        let frames = {
            let mut buf = self.buffer.lock();
            buf.sealed = true;
            std::mem::take(&mut buf.frames)
        };
        let meta = if frames.is_empty() {
            None
        } else {
            let duration = self.elapsed().min(self.window).as_secs_f64();
            let store = store.clone();
            match tokio::task::spawn_blocking(move || store.save(&frames, duration)).await {
                Ok(Ok(meta)) => Some(meta),
                Ok(Err(e)) => {
                    warn!(target: "webcam", "proof clip not saved: {}", e);
                    None
                }
                Err(e) => {
                    warn!(target: "webcam", "proof save task failed: {}", e);
                    None
                }
            }
        };
        core.saved = Some(meta.clone());
        (meta, true)
    }

    async fn discard(&self) {
        let mut core = self.core.lock().await;
        if core.saved.is_none() {
            let mut buf = self.buffer.lock();
            buf.sealed = true;
            buf.frames.clear();
            core.saved = Some(None);
        }
    }
}

type SessionMap = Arc<DashMap<ConnectionId, Arc<WebcamSession>>>;

pub struct WebcamStreamManager {
    camera: CameraSlot,
    store: Arc<ProofStore>,
    sessions: SessionMap,
}

impl WebcamStreamManager {
    pub fn new(camera: CameraSlot, store: Arc<ProofStore>) -> Self {
        Self { camera, store, sessions: Arc::new(DashMap::new()) }
    }

    pub fn camera(&self) -> &CameraSlot { &self.camera }

    pub fn is_active(&self, conn: &ConnectionId) -> bool { self.sessions.contains_key(conn) }

    pub fn active_count(&self) -> usize { self.sessions.len() }

    /// Start live streaming for `conn`. Already-live connections get `true` without a second open;
    /// a start racing an open in progress waits for it and reports its outcome.
    /// Returns `false` when the camera cannot be acquired.
    pub async fn start(
        &self,
        conn: &ConnectionId,
        fps: u32,
        window: Duration,
        on_frame: FrameSink,
        on_saved: ProofSink,
        cancel: CancelToken,
    ) -> bool {
        let fps = fps.clamp(1, MAX_FPS);
        let session = Arc::new(WebcamSession::new(window));
        // held until the session is live or rolled back; uncontended until the insert below
        let mut core = session.core.lock().await;
        let existing = match self.sessions.entry(conn.clone()) {
            Entry::Occupied(o) => Some(o.get().clone()),
            Entry::Vacant(v) => {
                v.insert(session.clone());
                None
            }
        };
        if let Some(existing) = existing {
            drop(core);
            let live = existing.core.lock().await.phase == Phase::Live;
            debug!(target: "webcam", conn = %conn, live, "start ignored, session already present");
            return live;
        }

        let lease = match self.camera.acquire(fps).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!(target: "webcam", conn = %conn, "camera open failed: {}", e);
                self.sessions.remove_if(conn, |_, s| Arc::ptr_eq(s, &session));
                return false;
            }
        };
        if session.stop.is_cancelled() || cancel.is_cancelled() {
            // stopped or disconnected while the device was opening
            drop(lease);
            self.sessions.remove_if(conn, |_, s| Arc::ptr_eq(s, &session));
            return false;
        }

        *session.started_at.lock() = Instant::now();
        core.phase = Phase::Live;

        let frame_loop = FrameLoop {
            session: session.clone(),
            sessions: self.sessions.clone(),
            conn: conn.clone(),
            store: self.store.clone(),
            fps,
            on_frame,
            on_saved: on_saved.clone(),
            cancel: cancel.clone(),
        };
        let frame_task = tokio::spawn(frame_loop.run(lease));
        let deadline_task = tokio::spawn(proof_deadline(session.clone(), self.store.clone(), on_saved, cancel));
        session.tasks.lock().extend([frame_task, deadline_task]);
        info!(target: "webcam", conn = %conn, fps, window_secs = window.as_secs_f64(), "webcam live");
        true
    }

    /// Stop the session, release the camera and save the window unless the deadline already did.
    /// When the deadline won, its clip is returned. A cancelled `cancel` discards unsaved frames.
    pub async fn stop_and_save(&self, conn: &ConnectionId, cancel: &CancelToken) -> Option<ProofMeta> {
        let (_, session) = self.sessions.remove(conn)?;
        // cancel before taking the lock so an open in progress rolls back
        session.stop.cancel();
        let prev = std::mem::replace(&mut session.core.lock().await.phase, Phase::Stopping);
        debug!(target: "webcam", conn = %conn, ?prev, "stopping webcam session");

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *session.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await { warn!(target: "webcam", "webcam task ended abnormally: {}", e); }
        }

        if cancel.is_cancelled() { session.discard().await; }
        let (meta, _) = session.save_once(&self.store).await;
        match &meta {
            Some(m) => info!(target: "webcam", conn = %conn, id = %m.id, frames = m.frame_count, "webcam stopped"),
            None => info!(target: "webcam", conn = %conn, "webcam stopped without evidence"),
        }
        meta
    }
}

struct FrameLoop {
    session: Arc<WebcamSession>,
    sessions: SessionMap,
    conn: ConnectionId,
    store: Arc<ProofStore>,
    fps: u32,
    on_frame: FrameSink,
    on_saved: ProofSink,
    cancel: CancelToken,
}

impl FrameLoop {
    async fn run(self, mut lease: CameraLease) {
        let session = &self.session;
        let mut ticker = tokio::time::interval(Duration::from_millis(1000 / self.fps as u64));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let device_ended = loop {
            tokio::select! {
                _ = session.stop.cancelled() => break false,
                _ = self.cancel.cancelled() => break false,
                _ = ticker.tick() => {}
            }
            let next = tokio::select! {
                _ = session.stop.cancelled() => break false,
                _ = self.cancel.cancelled() => break false,
                next = lease.next_frame() => next,
            };
            match next {
                Ok(Some(frame)) => {
                    session.record(&frame);
                    (self.on_frame)(&frame);
                }
                Ok(None) => {
                    warn!(target: "webcam", conn = %self.conn, "camera stream ended");
                    break true;
                }
                Err(e) => {
                    warn!(target: "webcam", conn = %self.conn, "camera read failed: {}", e);
                    break true;
                }
            }
        };
        drop(lease);
        if !device_ended { return; }

        // the session is over: release the slot for a new start and keep what was recorded
        session.stop.cancel();
        self.sessions.remove_if(&self.conn, |_, s| Arc::ptr_eq(s, session));
        if let (Some(meta), true) = session.save_once(&self.store).await {
            (self.on_saved)(&meta);
        }
        info!(target: "webcam", conn = %self.conn, "webcam session closed after device loss");
    }
}

async fn proof_deadline(session: Arc<WebcamSession>, store: Arc<ProofStore>, on_saved: ProofSink, cancel: CancelToken) {
    let window = session.window;
    tokio::select! {
        _ = session.stop.cancelled() => return,
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(window) => {}
    }
    if let (Some(meta), true) = session.save_once(&store).await {
        on_saved(&meta);
    }
}
