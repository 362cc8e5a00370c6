use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, MutexGuard,
};

use chrono::Utc;
use common::{
    api::LoadedProgram,
    protocol::{FileLoadRequest, FileMeta, LoadedFile, ServerEvent, ServerMessage, TaskError, TaskFinish, TaskProgress, TaskStart},
};
use gcode::{InterpreterConfig, NullSink, ParsedProgram};
use tracing::{debug, info, warn};

use crate::{
    multiplexer::{ClientId, Multiplexer},
    registry::SessionRegistry,
    session::SessionError,
};

#[derive(Default)]
struct Slot {
    file: Option<(FileMeta, Arc<str>)>,
    /// Bumped on every load and unload; a parse only lands if it still matches.
    generation: u64,
    parsed: Option<(u64, Arc<ParsedProgram>)>,
}

/// The single program currently loaded, whichever port (if any) it belongs to.
pub struct FileQueue {
    multiplexer: Arc<Multiplexer>,
    slot: Mutex<Slot>,
    next_task: AtomicU64,
}
impl FileQueue {
    pub fn new(multiplexer: Arc<Multiplexer>) -> Self {
        FileQueue { multiplexer, slot: Mutex::new(Slot::default()), next_task: AtomicU64::new(1) }
    }
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
    fn announce(&self, port: Option<&str>, event: ServerEvent) {
        match port {
            Some(port) => self.multiplexer.broadcast_room(port, event),
            None => self.multiplexer.broadcast_all(event),
        }
    }

    pub async fn load(self: &Arc<Self>, registry: &SessionRegistry, config: InterpreterConfig, request: FileLoadRequest) -> Result<FileMeta, SessionError> {
        let FileLoadRequest { port, name, content, visualizer } = request;
        let meta = FileMeta {
            name: name.clone(),
            size: content.len(),
            total_lines: content.lines().count(),
            visualizer,
            port: port.clone(),
            loaded_at: Utc::now(),
        };
        let content: Arc<str> = Arc::from(content);
        let generation = {
            let mut slot = self.lock();
            slot.generation += 1;
            slot.file = Some((meta.clone(), content.clone()));
            slot.parsed = None;
            slot.generation
        };
        info!("Loaded {} ({} lines, {} bytes)", meta.name, meta.total_lines, meta.size);
        if let Some(session) = port.as_deref().and_then(|port| registry.get(port)) {
            session.load_file(name, content.clone()).await?;
        }
        self.announce(port.as_deref(), ServerEvent::FileLoad(LoadedFile { meta: meta.clone(), content: content.to_string() }));
        self.start_parse(generation, meta.clone(), content, config);
        Ok(meta)
    }

    fn start_parse(self: &Arc<Self>, generation: u64, meta: FileMeta, content: Arc<str>, config: InterpreterConfig) {
        let task_id = self.next_task.fetch_add(1, Ordering::Relaxed);
        let port = meta.port.clone();
        self.announce(port.as_deref(), ServerEvent::TaskStart(TaskStart { task_id, name: meta.name.clone() }));
        let queue = self.clone();
        tokio::spawn(async move {
            let progress_queue = queue.clone();
            let progress_port = port.clone();
            let parsed = tokio::task::spawn_blocking(move || {
                ParsedProgram::parse(&content, &config, &mut NullSink, |percent| {
                    if progress_queue.lock().generation == generation {
                        progress_queue.announce(progress_port.as_deref(), ServerEvent::TaskProgress(TaskProgress { task_id, percent }));
                    }
                })
            })
            .await;
            match parsed {
                Ok(program) => {
                    let program = Arc::new(program);
                    let landed = {
                        let mut slot = queue.lock();
                        if slot.generation == generation {
                            slot.parsed = Some((task_id, program.clone()));
                            true
                        } else {
                            false
                        }
                    };
                    if landed {
                        debug!("Parsed {} in task {}", meta.name, task_id);
                        queue.announce(port.as_deref(), ServerEvent::TaskFinish(TaskFinish { task_id, summary: program.summary.clone() }));
                    } else {
                        debug!("Discarding superseded parse of {}", meta.name);
                    }
                }
                Err(error) => {
                    warn!("Parse of {} failed: {}", meta.name, error);
                    queue.announce(port.as_deref(), ServerEvent::TaskError(TaskError { task_id, message: error.to_string() }));
                }
            }
        });
    }

    /// Parses the loaded program again, e.g. after the interpreter settings changed.
    pub fn reparse(self: &Arc<Self>, config: InterpreterConfig) -> bool {
        let (generation, meta, content) = {
            let mut slot = self.lock();
            let Some((meta, content)) = slot.file.clone() else { return false };
            slot.generation += 1;
            slot.parsed = None;
            (slot.generation, meta, content)
        };
        self.start_parse(generation, meta, content, config);
        true
    }

    pub async fn unload(&self, registry: &SessionRegistry) -> Result<bool, SessionError> {
        let file = {
            let mut slot = self.lock();
            slot.generation += 1;
            slot.parsed = None;
            slot.file.take()
        };
        let Some((meta, _)) = file else { return Ok(false) };
        if let Some(session) = meta.port.as_deref().and_then(|port| registry.get(port)) {
            session.unload_file().await?;
        }
        info!("Unloaded {}", meta.name);
        self.multiplexer.broadcast_all(ServerEvent::FileUnload);
        Ok(true)
    }

    /// Brings a client up to date with the loaded program, if there is one.
    pub fn send_current(&self, client: ClientId) -> bool {
        let (file, parsed) = {
            let slot = self.lock();
            (slot.file.clone(), slot.parsed.clone())
        };
        let Some((meta, content)) = file else { return false };
        self.multiplexer.send_to(client, ServerMessage::Event(ServerEvent::FileLoad(LoadedFile { meta, content: content.to_string() })));
        if let Some((task_id, program)) = parsed {
            self.multiplexer.send_to(client, ServerMessage::Event(ServerEvent::TaskFinish(TaskFinish { task_id, summary: program.summary.clone() })));
        }
        true
    }

    pub fn current(&self) -> Option<LoadedProgram> {
        let slot = self.lock();
        let (meta, _) = slot.file.as_ref()?;
        Some(LoadedProgram {
            meta: meta.clone(),
            summary: slot.parsed.as_ref().map(|(_, program)| program.summary.clone()),
        })
    }
    pub fn content_for(&self, port: &str) -> Option<(String, Arc<str>)> {
        let slot = self.lock();
        let (meta, content) = slot.file.as_ref()?;
        (meta.port.as_deref() == Some(port)).then(|| (meta.name.clone(), content.clone()))
    }
    pub fn parsed(&self) -> Option<Arc<ParsedProgram>> {
        self.lock().parsed.as_ref().map(|(_, program)| program.clone())
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::{sync::mpsc, time::timeout};

    use super::*;
    use crate::{cnc::controller::ControllerKind, testing::{test_options, MockOpener}, registry::SessionContext};

    fn setup() -> (Arc<FileQueue>, SessionRegistry, Arc<Multiplexer>) {
        let multiplexer = Arc::new(Multiplexer::new());
        let registry = SessionRegistry::new(SessionContext {
            opener: Arc::new(MockOpener::default()),
            multiplexer: multiplexer.clone(),
            options: test_options(),
        });
        (Arc::new(FileQueue::new(multiplexer.clone())), registry, multiplexer)
    }

    fn request(port: Option<&str>, name: &str, content: &str) -> FileLoadRequest {
        FileLoadRequest { port: port.map(str::to_string), name: name.to_string(), content: content.to_string(), visualizer: None }
    }

    async fn wait_for_finish(receiver: &mut mpsc::UnboundedReceiver<ServerMessage>) -> TaskFinish {
        timeout(Duration::from_secs(5), async {
            loop {
                if let Some(ServerMessage::Event(ServerEvent::TaskFinish(finish))) = receiver.recv().await {
                    return finish;
                }
            }
        }).await.unwrap()
    }

    fn drain(receiver: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(ServerMessage::Event(event)) = receiver.try_recv() {
            names.push(event.name());
        }
        names
    }

    #[tokio::test]
    async fn test_load_broadcasts_to_port_room_only() {
        let (queue, registry, multiplexer) = setup();
        let (a, mut a_receiver) = multiplexer.register();
        let (b, mut b_receiver) = multiplexer.register();
        multiplexer.join(a, "COM1");
        multiplexer.join(b, "COM2");
        let meta = queue.load(&registry, InterpreterConfig::default(), request(Some("COM1"), "part.nc", "G21\nG0 X10\nG1 Y10 F300\n")).await.unwrap();
        assert_eq!((meta.size, meta.total_lines), (23, 3));
        let finish = wait_for_finish(&mut a_receiver).await;
        assert_eq!(finish.summary.total_lines, 3);
        assert!(drain(&mut b_receiver).is_empty());
        let current = queue.current().unwrap();
        assert_eq!(current.meta.name, "part.nc");
        assert_eq!(current.summary, Some(finish.summary));
    }

    #[tokio::test]
    async fn test_load_reaches_open_session() {
        let (queue, registry, _multiplexer) = setup();
        let session = registry.get_or_create("COM1", ControllerKind::Grbl).await.unwrap();
        queue.load(&registry, InterpreterConfig::default(), request(Some("COM1"), "part.nc", "G0 X1")).await.unwrap();
        assert_eq!(session.program_name().as_deref(), Some("part.nc"));
        assert_eq!(queue.content_for("COM1").map(|(name, _)| name).as_deref(), Some("part.nc"));
        assert!(queue.content_for("COM2").is_none());
        queue.unload(&registry).await.unwrap();
        assert_eq!(session.program_name(), None);
    }

    #[tokio::test]
    async fn test_newer_load_supersedes() {
        let (queue, registry, multiplexer) = setup();
        let (_client, mut receiver) = multiplexer.register();
        let long: String = (0..20000).map(|i| format!("G1 X{} Y{} F1000\n", i % 100, i % 37)).collect();
        queue.load(&registry, InterpreterConfig::default(), request(None, "long.nc", &long)).await.unwrap();
        queue.load(&registry, InterpreterConfig::default(), request(None, "short.nc", "G0 X1\n")).await.unwrap();
        let finish = timeout(Duration::from_secs(10), async {
            loop {
                let finish = wait_for_finish(&mut receiver).await;
                if finish.summary.total_lines == 1 {
                    return finish;
                }
            }
        }).await.unwrap();
        // Give the long parse time to finish and be thrown away.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let current = queue.current().unwrap();
        assert_eq!(current.meta.name, "short.nc");
        assert_eq!(current.summary, Some(finish.summary));
        assert_eq!(queue.parsed().unwrap().lines.len(), 1);
    }

    #[tokio::test]
    async fn test_late_client_receives_program() {
        let (queue, registry, multiplexer) = setup();
        let (_early, mut early_receiver) = multiplexer.register();
        queue.load(&registry, InterpreterConfig::default(), request(None, "part.nc", "G0 X1\n")).await.unwrap();
        wait_for_finish(&mut early_receiver).await;
        let (late, mut late_receiver) = multiplexer.register();
        assert!(queue.send_current(late));
        assert_eq!(drain(&mut late_receiver), vec!["file:load", "task:finish"]);

        assert!(queue.unload(&registry).await.unwrap());
        assert!(!queue.unload(&registry).await.unwrap());
        assert_eq!(drain(&mut late_receiver), vec!["file:unload"]);
        assert!(!queue.send_current(late));
        assert!(queue.current().is_none());
    }
}
