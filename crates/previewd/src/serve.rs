use crate::build_cache::BuildCache;
use crate::config::ProjectConfig;
use crate::protocol::{encode_event, parse_command, Command, DeviceFields, Event};
use crate::stream::{Control, DeviceRegistry, StreamContext, StreamHandle};
use crate::watcher::SharedWatcher;
use crate::Result;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

/// Upper bound on buffered outgoing events before frames start being
/// dropped latest-frame-wins.
const WRITER_QUEUE_CAP: usize = 64;

pub struct ServeOptions {
    pub config: ProjectConfig,
    pub reuse_build: bool,
    pub default_device: Option<String>,
}

/// Multiplexer entry point: reads command lines from stdin until EOF,
/// dispatches to streams, and writes event lines to stdout through a
/// single writer task.
pub async fn run_serve(options: ServeOptions) -> Result<()> {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_events(event_rx));

    let mut backend = Backend::new(options, event_tx);
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        match parse_command(&line) {
            Ok(command) => backend.dispatch(command).await,
            Err(protocol_error) => backend.emit(protocol_error),
        }
    }

    eprintln!("[Serve] stdin closed, shutting down {} stream(s)", backend.streams.len());
    backend.shutdown().await;
    drop(backend);
    let _ = writer.await;
    Ok(())
}

struct Backend {
    config: ProjectConfig,
    reuse_build: bool,
    default_device: Option<String>,
    build_cache: Arc<BuildCache>,
    devices: Arc<DeviceRegistry>,
    watcher: Option<Arc<SharedWatcher>>,
    streams: HashMap<String, StreamHandle>,
    events: mpsc::UnboundedSender<Event>,
}

impl Backend {
    fn new(options: ServeOptions, events: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            config: options.config,
            reuse_build: options.reuse_build,
            default_device: options.default_device,
            build_cache: Arc::new(BuildCache::new()),
            devices: Arc::new(DeviceRegistry::new()),
            watcher: None,
            streams: HashMap::new(),
            events,
        }
    }

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    async fn dispatch(&mut self, command: Command) {
        self.reap();
        match command {
            Command::AddStream {
                request_id,
                stream_id,
                file,
                device,
                selector,
            } => {
                if self.streams.contains_key(&stream_id) {
                    self.emit(Event::ProtocolError {
                        request_id: Some(request_id),
                        message: format!("stream {} already exists", stream_id),
                    });
                    return;
                }
                self.add_stream(stream_id, file, device, selector);
            }
            Command::RemoveStream {
                request_id,
                stream_id,
            } => match self.streams.remove(&stream_id) {
                Some(handle) => {
                    handle.stop().await;
                    self.maybe_drop_watcher();
                }
                None => self.emit(Event::ProtocolError {
                    request_id: Some(request_id),
                    message: format!("unknown stream {}", stream_id),
                }),
            },
            Command::ReplaceAllStreams {
                request_id: _,
                stream_id,
                file,
                device,
                selector,
            } => {
                for handle in self.streams.values() {
                    handle.request_stop();
                }
                for (_, handle) in self.streams.drain() {
                    handle.join().await;
                }
                self.maybe_drop_watcher();
                self.add_stream(stream_id, file, device, selector);
            }
            Command::SendInput { stream_id, event } => {
                self.forward(&stream_id, Control::SendInput(event)).await;
            }
            Command::NextPreview { stream_id } => {
                self.forward(&stream_id, Control::NextPreview).await;
            }
            Command::ChangeDevice {
                request_id,
                stream_id,
                device,
            } => match self.streams.get(&stream_id) {
                Some(handle) => {
                    if !handle.send_control(Control::ChangeDevice(device)).await {
                        self.emit(Event::ProtocolError {
                            request_id: Some(request_id),
                            message: format!("stream {} is shutting down", stream_id),
                        });
                    }
                }
                None => self.emit(Event::ProtocolError {
                    request_id: Some(request_id),
                    message: format!("unknown stream {}", stream_id),
                }),
            },
        }
    }

    fn add_stream(
        &mut self,
        stream_id: String,
        file: PathBuf,
        mut device: DeviceFields,
        selector: Option<crate::analyzer::Selector>,
    ) {
        if device == DeviceFields::default() {
            device.udid = self.default_device.clone();
        }
        let watcher = match self.watcher() {
            Ok(watcher) => watcher,
            Err(e) => {
                self.emit(Event::StreamStopped {
                    stream_id,
                    reason: e.reason().into(),
                    message: e.to_string(),
                    diagnostic: None,
                });
                return;
            }
        };
        let ctx = StreamContext {
            config: self.config.clone(),
            build_cache: self.build_cache.clone(),
            watcher,
            devices: self.devices.clone(),
            events: self.events.clone(),
            reuse_build: self.reuse_build,
        };
        let handle = StreamHandle::spawn(stream_id.clone(), file, selector, device, ctx);
        self.streams.insert(stream_id, handle);
    }

    async fn forward(&mut self, stream_id: &str, control: Control) {
        let delivered = match self.streams.get(stream_id) {
            Some(handle) => handle.send_control(control).await,
            None => false,
        };
        if !delivered {
            self.emit(Event::ProtocolError {
                request_id: None,
                message: format!("unknown stream {}", stream_id),
            });
        }
    }

    /// The single filesystem watcher, created with the first stream and
    /// dropped with the last.
    fn watcher(&mut self) -> Result<Arc<SharedWatcher>> {
        if let Some(watcher) = &self.watcher {
            return Ok(watcher.clone());
        }
        let root = self
            .config
            .primary_path()
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let watcher = Arc::new(SharedWatcher::new(&root)?);
        self.watcher = Some(watcher.clone());
        Ok(watcher)
    }

    fn maybe_drop_watcher(&mut self) {
        if self.streams.is_empty()
            && self
                .watcher
                .as_ref()
                .is_some_and(|watcher| watcher.is_idle())
        {
            self.watcher = None;
        }
    }

    /// Drops handles whose supervisor already exited on its own.
    fn reap(&mut self) {
        self.streams.retain(|_, handle| !handle.is_finished());
        self.maybe_drop_watcher();
    }

    /// Cancels all streams in parallel and waits for their subprocesses.
    async fn shutdown(&mut self) {
        for handle in self.streams.values() {
            handle.request_stop();
        }
        for (_, handle) in self.streams.drain() {
            handle.join().await;
        }
        self.watcher = None;
    }
}

async fn write_events(mut rx: mpsc::UnboundedReceiver<Event>) {
    let mut stdout = tokio::io::stdout();
    let mut queue = EventQueue::new(WRITER_QUEUE_CAP);
    let mut open = true;
    while open || !queue.is_empty() {
        if queue.is_empty() {
            match rx.recv().await {
                Some(event) => queue.push(event),
                None => break,
            }
        }
        // Absorb whatever else is already queued so overflow policy sees
        // the full backlog.
        loop {
            match rx.try_recv() {
                Ok(event) => queue.push(event),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    open = false;
                    break;
                }
            }
        }
        if let Some(event) = queue.pop() {
            let mut line = encode_event(&event);
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() {
                return;
            }
            let _ = stdout.flush().await;
        }
    }
}

/// Outgoing event buffer with latest-frame-wins overflow: when full, the
/// oldest unsent `Frame` (preferring the incoming frame's stream) makes
/// room. Lifecycle events are never dropped.
struct EventQueue {
    queue: VecDeque<Event>,
    cap: usize,
}

impl EventQueue {
    fn new(cap: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            cap,
        }
    }

    fn push(&mut self, event: Event) {
        if self.queue.len() < self.cap {
            self.queue.push_back(event);
            return;
        }
        if event.is_frame() {
            let same_stream = self.queue.iter().position(|queued| {
                queued.is_frame() && queued.stream_id() == event.stream_id()
            });
            let victim = same_stream.or_else(|| self.queue.iter().position(Event::is_frame));
            match victim {
                Some(pos) => {
                    self.queue.remove(pos);
                    self.queue.push_back(event);
                }
                // Nothing but lifecycle events queued: the frame loses.
                None => {}
            }
            return;
        }
        // Lifecycle events always enter; evict the oldest frame if any.
        if let Some(pos) = self.queue.iter().position(Event::is_frame) {
            self.queue.remove(pos);
        }
        self.queue.push_back(event);
    }

    fn pop(&mut self) -> Option<Event> {
        self.queue.pop_front()
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FramePayload, StatusPhase};

    fn frame(stream_id: &str, data: &str) -> Event {
        Event::Frame {
            stream_id: stream_id.into(),
            frame: FramePayload { data: data.into() },
        }
    }

    fn status(stream_id: &str) -> Event {
        Event::StreamStatus {
            stream_id: stream_id.into(),
            phase: StatusPhase::Running,
            diagnostic: None,
        }
    }

    #[test]
    fn overflow_drops_oldest_frame_of_same_stream() {
        let mut queue = EventQueue::new(2);
        queue.push(frame("s1", "old"));
        queue.push(frame("s2", "other"));
        queue.push(frame("s1", "new"));

        let drained: Vec<Event> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(drained, vec![frame("s2", "other"), frame("s1", "new")]);
    }

    #[test]
    fn overflow_never_drops_lifecycle_events() {
        let mut queue = EventQueue::new(2);
        queue.push(status("s1"));
        queue.push(frame("s1", "f1"));
        queue.push(status("s2"));

        let drained: Vec<Event> = std::iter::from_fn(|| queue.pop()).collect();
        // The frame was evicted to admit the lifecycle event.
        assert_eq!(drained, vec![status("s1"), status("s2")]);
    }

    #[test]
    fn incoming_frame_loses_against_full_lifecycle_queue() {
        let mut queue = EventQueue::new(2);
        queue.push(status("s1"));
        queue.push(status("s2"));
        queue.push(frame("s1", "f1"));

        let drained: Vec<Event> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(drained, vec![status("s1"), status("s2")]);
    }

    #[test]
    fn order_is_preserved_under_capacity() {
        let mut queue = EventQueue::new(8);
        queue.push(status("s1"));
        queue.push(frame("s1", "f1"));
        queue.push(frame("s1", "f2"));

        let drained: Vec<Event> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(
            drained,
            vec![status("s1"), frame("s1", "f1"), frame("s1", "f2")]
        );
    }

    #[test]
    fn frame_from_other_stream_evicts_globally_oldest_frame() {
        let mut queue = EventQueue::new(2);
        queue.push(frame("s1", "f1"));
        queue.push(status("s2"));
        queue.push(frame("s2", "f2"));

        let drained: Vec<Event> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(drained, vec![status("s2"), frame("s2", "f2")]);
    }
}
