use crate::analyzer::{self, Selector};
use crate::build_cache::{BuildArtifact, BuildCache};
use crate::companion::Companion;
use crate::config::ProjectConfig;
use crate::dirs::PreviewDirs;
use crate::protocol::{DeviceFields, Event, FramePayload, StatusPhase};
use crate::simulator;
use crate::thunk::{CompileOutcome, RebuildGate, ThunkCompiler};
use crate::transport::{InputEvent, Transport};
use crate::watcher::SharedWatcher;
use crate::{PreviewError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Quiet window after a file event before a rebuild fires; further events
/// inside the window restart it so the latest write always wins.
const REBUILD_DEBOUNCE: Duration = Duration::from_millis(150);

/// Environment key the host app reads to find the thunk directory.
const THUNK_DIR_ENV: &str = "PREVIEWD_THUNK_DIR";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    Building,
    Booting,
    Launching,
    Running,
    Rebuilding,
    Stopped,
}

#[derive(Debug)]
pub enum Control {
    SendInput(InputEvent),
    NextPreview,
    ChangeDevice(DeviceFields),
}

/// Shared services handed to every stream by the multiplexer.
#[derive(Clone)]
pub struct StreamContext {
    pub config: ProjectConfig,
    pub build_cache: Arc<BuildCache>,
    pub watcher: Arc<SharedWatcher>,
    pub devices: Arc<DeviceRegistry>,
    pub events: mpsc::UnboundedSender<Event>,
    pub reuse_build: bool,
}

/// Boot-holder refcounts per udid: the device is booted on first acquire
/// and shut down when the last stream releases it.
pub struct DeviceRegistry {
    inner: Mutex<HashMap<String, DeviceEntry>>,
}

struct DeviceEntry {
    count: usize,
    boot: Companion,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Boots `udid` headlessly if no stream holds it yet. Returns the
    /// boot holder's `done` channel for involuntary-exit detection.
    pub async fn acquire(
        &self,
        udid: &str,
        device_set: &Path,
    ) -> Result<watch::Receiver<Option<String>>> {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.get_mut(udid) {
            entry.count += 1;
            return Ok(entry.boot.done());
        }
        let boot = Companion::boot_headless(udid, device_set).await?;
        let done = boot.done();
        inner.insert(udid.to_string(), DeviceEntry { count: 1, boot });
        Ok(done)
    }

    /// Drops one reference; shuts the device down when it was the last.
    pub async fn release(&self, udid: &str) {
        let entry = {
            let mut inner = self.inner.lock().await;
            match inner.get_mut(udid) {
                Some(entry) if entry.count > 1 => {
                    entry.count -= 1;
                    None
                }
                Some(_) => inner.remove(udid),
                None => None,
            }
        };
        if let Some(mut entry) = entry {
            entry.boot.stop();
            let _ = entry.boot.wait().await;
            if let Err(e) = simulator::shutdown(udid).await {
                eprintln!("[Stream] shutdown of {} failed: {}", udid, e);
            }
        }
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle the multiplexer keeps per stream.
pub struct StreamHandle {
    pub id: String,
    control: mpsc::Sender<Control>,
    cancel: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl StreamHandle {
    pub fn spawn(
        id: String,
        file: PathBuf,
        selector: Option<Selector>,
        device: DeviceFields,
        ctx: StreamContext,
    ) -> StreamHandle {
        let (control_tx, control_rx) = mpsc::channel(16);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let join = tokio::spawn(run(
            id.clone(),
            file,
            selector,
            device,
            ctx,
            control_rx,
            cancel_rx,
        ));
        StreamHandle {
            id,
            control: control_tx,
            cancel: cancel_tx,
            join,
        }
    }

    pub async fn send_control(&self, control: Control) -> bool {
        self.control.send(control).await.is_ok()
    }

    /// Signals stop without waiting; pair with `join` for shutdown.
    pub fn request_stop(&self) {
        let _ = self.cancel.send(true);
    }

    /// True once the supervisor task has exited (self-stopped streams).
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn join(self) {
        let _ = self.join.await;
    }

    pub async fn stop(self) {
        self.request_stop();
        self.join().await;
    }
}

/// Why the supervisor loop ended without an error.
enum Exit {
    Removed,
}

struct Session {
    udid: String,
    compiler: ThunkCompiler,
    boot_done: watch::Receiver<Option<String>>,
    video: Companion,
    transport: Transport,
    frames: mpsc::Receiver<Vec<u8>>,
}

/// How a rebuild attempt ended.
enum Rebuilt {
    /// New thunk published; the preview spec was replaced.
    Swapped,
    /// Stream keeps running on the previous dylib.
    Kept,
    /// A stop request arrived mid-compile.
    Stopped,
}

#[allow(clippy::too_many_arguments)]
async fn run(
    id: String,
    file: PathBuf,
    selector: Option<Selector>,
    device: DeviceFields,
    ctx: StreamContext,
    control_rx: mpsc::Receiver<Control>,
    cancel_rx: watch::Receiver<bool>,
) {
    let mut released_udid = None;
    let result = supervise(
        &id,
        &file,
        selector,
        &device,
        &ctx,
        control_rx,
        cancel_rx,
        &mut released_udid,
    )
    .await;

    ctx.watcher.unsubscribe(&id);
    if let Some(udid) = released_udid {
        ctx.devices.release(&udid).await;
    }

    let stopped = match result {
        Ok(Exit::Removed) => Event::StreamStopped {
            stream_id: id.clone(),
            reason: "Stopped".into(),
            message: "stream stopped".into(),
            diagnostic: None,
        },
        Err(err) => Event::StreamStopped {
            stream_id: id.clone(),
            reason: err.reason().into(),
            message: err.to_string(),
            diagnostic: err.diagnostic().map(String::from),
        },
    };
    let _ = ctx.events.send(stopped);
    eprintln!("[Stream:{}] stopped", id);
}

#[allow(clippy::too_many_arguments)]
async fn supervise(
    id: &str,
    file: &Path,
    selector: Option<Selector>,
    device: &DeviceFields,
    ctx: &StreamContext,
    mut control_rx: mpsc::Receiver<Control>,
    mut cancel_rx: watch::Receiver<bool>,
    released_udid: &mut Option<String>,
) -> Result<Exit> {
    let mut phase = Phase::Initializing;

    // Fail fast on unreadable files and bad selectors, before any build.
    let contents = std::fs::read_to_string(file)?;
    let mut preview = analyzer::select(&contents, selector.as_ref())?;
    let mut current_selector = selector.or(Some(Selector::Index(0)));

    transition(id, &mut phase, Phase::Building);
    emit_status(ctx, id, StatusPhase::Building, None);
    let udid = resolve_device(device).await?;
    let device_set = simulator::device_set_path()?;
    let dirs = PreviewDirs::new(&ctx.config.project_key(), &udid)?;
    dirs.ensure_created()?;
    // A stop request must not wait out a full build or boot.
    let artifact = tokio::select! {
        result = ctx.build_cache.build_or_reuse(&ctx.config, &dirs, ctx.reuse_build) => result?,
        _ = cancel_rx.changed() => return Ok(Exit::Removed),
    };

    let mut gate = RebuildGate::new();
    transition(id, &mut phase, Phase::Booting);
    emit_status(ctx, id, StatusPhase::Booting, None);
    let attach_fut = attach(
        id,
        ctx,
        &mut phase,
        &mut gate,
        &udid,
        &device_set,
        dirs,
        artifact.clone(),
        &preview.body_text,
        released_udid,
    );
    let mut session = tokio::select! {
        result = attach_fut => result?,
        _ = cancel_rx.changed() => return Ok(Exit::Removed),
    };

    let mut watch_rx = ctx.watcher.subscribe(id);
    transition(id, &mut phase, Phase::Running);
    let _ = ctx.events.send(Event::StreamStarted {
        stream_id: id.to_string(),
        device: session.udid.clone(),
        preview_title: preview.resolved_title.clone(),
    });

    let mut video_done = session.video.done();
    loop {
        tokio::select! {
            _ = cancel_rx.changed() => {
                gate.cancel_all();
                teardown(&mut session).await;
                transition(id, &mut phase, Phase::Stopped);
                return Ok(Exit::Removed);
            }
            maybe = session.frames.recv() => match maybe {
                Some(bytes) => {
                    let _ = ctx.events.send(Event::Frame {
                        stream_id: id.to_string(),
                        frame: FramePayload { data: BASE64.encode(&bytes) },
                    });
                }
                None => {
                    let desc = session.video.wait().await;
                    return Err(PreviewError::TransportClosed(desc));
                }
            },
            _ = video_done.changed() => {
                let desc = session.video.wait().await;
                return Err(PreviewError::TransportClosed(desc));
            }
            _ = session.boot_done.changed() => {
                return Err(PreviewError::BootFailed("simulator exited".into()));
            }
            event = watch_rx.recv() => {
                if event.as_deref() == Some(file) {
                    debounce(&mut watch_rx).await;
                    match rebuild(
                        id, ctx, &mut phase, &mut gate, &session, file,
                        &current_selector, &mut preview, &mut watch_rx, &mut cancel_rx, false,
                    )
                    .await?
                    {
                        Rebuilt::Stopped => {
                            teardown(&mut session).await;
                            return Ok(Exit::Removed);
                        }
                        Rebuilt::Swapped | Rebuilt::Kept => {}
                    }
                }
            }
            control = control_rx.recv() => match control {
                Some(Control::SendInput(input)) => {
                    if session.transport.send_input(&input).await.is_err() {
                        let desc = session.video.wait().await;
                        return Err(PreviewError::TransportClosed(desc));
                    }
                }
                Some(Control::NextPreview) => {
                    let next = Selector::Index(analyzer::next_preview(preview.index, preview.count));
                    match rebuild(
                        id, ctx, &mut phase, &mut gate, &session, file,
                        &Some(next.clone()), &mut preview, &mut watch_rx, &mut cancel_rx, true,
                    )
                    .await?
                    {
                        Rebuilt::Swapped => current_selector = Some(next),
                        Rebuilt::Kept => {}
                        Rebuilt::Stopped => {
                            teardown(&mut session).await;
                            return Ok(Exit::Removed);
                        }
                    }
                }
                Some(Control::ChangeDevice(fields)) => {
                    gate.cancel_all();
                    teardown(&mut session).await;
                    if let Some(udid) = released_udid.take() {
                        ctx.devices.release(&udid).await;
                    }
                    transition(id, &mut phase, Phase::Booting);
                    emit_status(ctx, id, StatusPhase::Booting, None);
                    let udid = resolve_device(&fields).await?;
                    let dirs = PreviewDirs::new(&ctx.config.project_key(), &udid)?;
                    dirs.ensure_created()?;
                    session = attach(
                        id, ctx, &mut phase, &mut gate, &udid, &device_set,
                        dirs, artifact.clone(), &preview.body_text, released_udid,
                    )
                    .await?;
                    video_done = session.video.done();
                    transition(id, &mut phase, Phase::Running);
                    emit_status(ctx, id, StatusPhase::Running, None);
                }
                None => {
                    gate.cancel_all();
                    teardown(&mut session).await;
                    transition(id, &mut phase, Phase::Stopped);
                    return Ok(Exit::Removed);
                }
            },
        }
    }
}

/// Boot → launch → attach transport for one device. The initial thunk
/// compiles concurrently with app install/launch.
#[allow(clippy::too_many_arguments)]
async fn attach(
    id: &str,
    ctx: &StreamContext,
    phase: &mut Phase,
    gate: &mut RebuildGate,
    udid: &str,
    device_set: &Path,
    dirs: PreviewDirs,
    artifact: Arc<BuildArtifact>,
    body_text: &str,
    released_udid: &mut Option<String>,
) -> Result<Session> {
    let boot_done = ctx.devices.acquire(udid, device_set).await?;
    *released_udid = Some(udid.to_string());

    transition(id, phase, Phase::Launching);
    emit_status(ctx, id, StatusPhase::Launching, None);
    let compiler = ThunkCompiler::new(dirs.clone(), artifact.clone());
    let thunk_dir = dirs.thunk.display().to_string();
    let launch = async {
        simulator::install_app(udid, &artifact.app_bundle_path).await?;
        simulator::launch_app(
            udid,
            &artifact.bundle_id,
            &[(THUNK_DIR_ENV, thunk_dir.as_str())],
        )
        .await
    };
    let (launch_result, compile_result) =
        tokio::join!(launch, compiler.compile(body_text, gate.begin()));
    launch_result?;
    match compile_result {
        Ok(_) => {}
        // The host shows its stub until the first good rebuild.
        Err(PreviewError::CompileError { diagnostic }) => {
            emit_status(ctx, id, StatusPhase::CompileError, Some(diagnostic));
        }
        Err(other) => return Err(other),
    }

    let video = Companion::start(udid, device_set).await?;
    let port = video
        .port()
        .ok_or_else(|| PreviewError::CompanionNotReady("no port in handshake".into()))?;
    let mut transport = Transport::connect(port).await?;
    let frames = transport
        .frames()
        .expect("frame receiver available on a fresh transport");

    Ok(Session {
        udid: udid.to_string(),
        compiler,
        boot_done,
        video,
        transport,
        frames,
    })
}

async fn teardown(session: &mut Session) {
    session.transport.close().await;
    session.video.stop();
    let _ = session.video.wait().await;
}

/// Re-reads the source, re-extracts the preview body, and compiles a new
/// thunk. A fresh file event for the same source — or a stop request —
/// cancels the in-flight compile.
#[allow(clippy::too_many_arguments)]
async fn rebuild(
    id: &str,
    ctx: &StreamContext,
    phase: &mut Phase,
    gate: &mut RebuildGate,
    session: &Session,
    file: &Path,
    selector: &Option<Selector>,
    preview: &mut analyzer::PreviewSpec,
    watch_rx: &mut mpsc::Receiver<PathBuf>,
    cancel_rx: &mut watch::Receiver<bool>,
    from_next_preview: bool,
) -> Result<Rebuilt> {
    loop {
        transition(id, phase, Phase::Rebuilding);
        emit_status(ctx, id, StatusPhase::Rebuilding, None);

        let contents = std::fs::read_to_string(file)?;
        let candidate = match analyzer::select(&contents, selector.as_ref()) {
            Ok(candidate) => candidate,
            Err(err @ (PreviewError::SelectorNotFound(_)
                | PreviewError::SelectorOutOfRange { .. }
                | PreviewError::NoPreviewFound))
                if from_next_preview =>
            {
                emit_status(ctx, id, StatusPhase::CompileError, Some(err.to_string()));
                transition(id, phase, Phase::Running);
                return Ok(Rebuilt::Kept);
            }
            Err(err) => return Err(err),
        };

        let outcome = {
            let mut compile = pin!(session.compiler.compile(&candidate.body_text, gate.begin()));
            loop {
                tokio::select! {
                    outcome = &mut compile => break outcome,
                    event = watch_rx.recv() => {
                        if event.as_deref() == Some(file) {
                            // Newer edit supersedes this compile.
                            gate.cancel_all();
                            let _ = (&mut compile).await;
                            debounce(watch_rx).await;
                            break Ok(CompileOutcome::Cancelled);
                        }
                    }
                    _ = cancel_rx.changed() => {
                        gate.cancel_all();
                        let _ = (&mut compile).await;
                        return Ok(Rebuilt::Stopped);
                    }
                }
            }
        };

        match outcome {
            Ok(CompileOutcome::Done(record)) => {
                eprintln!(
                    "[Stream:{}] thunk published at {}",
                    id,
                    record.thunk_dylib_path.display()
                );
                *preview = candidate;
                transition(id, phase, Phase::Running);
                emit_status(ctx, id, StatusPhase::Running, None);
                return Ok(Rebuilt::Swapped);
            }
            Ok(CompileOutcome::Cancelled) => continue,
            Err(PreviewError::CompileError { diagnostic }) => {
                emit_status(ctx, id, StatusPhase::CompileError, Some(diagnostic));
                transition(id, phase, Phase::Running);
                return Ok(Rebuilt::Kept);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Waits out the debounce window, draining the trailing events of a
/// burst; the rebuild then snapshots the latest content.
async fn debounce(watch_rx: &mut mpsc::Receiver<PathBuf>) {
    loop {
        match timeout(REBUILD_DEBOUNCE, watch_rx.recv()).await {
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => return,
        }
    }
}

async fn resolve_device(fields: &DeviceFields) -> Result<String> {
    if let Some(udid) = fields.udid.as_deref() {
        let (udid, _) = simulator::resolve(Some(udid)).await?;
        return Ok(udid);
    }
    if let (Some(device_type), Some(runtime)) =
        (fields.device_type_id.as_deref(), fields.runtime_id.as_deref())
    {
        // Reuse a matching device in the set before creating one.
        if let Ok(existing) = simulator::list().await {
            if let Some(device) = existing
                .iter()
                .find(|d| d.device_type == device_type && d.runtime == runtime)
            {
                return Ok(device.udid.clone());
            }
        }
        return simulator::add(device_type, runtime).await;
    }
    let (udid, _) = simulator::resolve(None).await?;
    Ok(udid)
}

fn emit_status(ctx: &StreamContext, id: &str, status: StatusPhase, diagnostic: Option<String>) {
    let _ = ctx.events.send(Event::StreamStatus {
        stream_id: id.to_string(),
        phase: status,
        diagnostic,
    });
}

fn transition(id: &str, phase: &mut Phase, next: Phase) {
    if *phase != next {
        eprintln!("[Stream:{}] {:?} -> {:?}", id, *phase, next);
        *phase = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn debounce_drains_burst_and_returns_after_quiet() {
        let (tx, mut rx) = mpsc::channel(8);
        let file = PathBuf::from("/p/V.swift");
        for _ in 0..3 {
            tx.try_send(file.clone()).unwrap();
        }

        let started = std::time::Instant::now();
        debounce(&mut rx).await;
        // The queue is drained and we waited out one quiet window.
        assert!(rx.try_recv().is_err());
        assert!(started.elapsed() >= REBUILD_DEBOUNCE);
    }

    #[tokio::test]
    async fn debounce_honors_trailing_event() {
        let (tx, mut rx) = mpsc::channel(8);
        let file = PathBuf::from("/p/V.swift");
        tx.try_send(file.clone()).unwrap();

        let sender = tokio::spawn({
            let tx = tx.clone();
            let file = file.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let _ = tx.send(file).await;
            }
        });

        debounce(&mut rx).await;
        sender.await.unwrap();
        // The late event inside the window was consumed, not left queued.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn phase_transitions_are_recorded() {
        let mut phase = Phase::Initializing;
        transition("s1", &mut phase, Phase::Building);
        assert_eq!(phase, Phase::Building);
        transition("s1", &mut phase, Phase::Building);
        assert_eq!(phase, Phase::Building);
    }
}
