//! Per-room session: exclusive room lock, the session's permission engine,
//! the current default agent and slash-directive handling

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::commands::{Directive, HELP, Input, parse_input};
use crate::dispatch::{Dispatcher, TurnReport};
use crate::error::{DispatchError, SessionError};
use crate::history::export_room;
use crate::permissions::{BatchChoice, BatchReport, PermissionEngine};
use crate::types::Message;

const MAX_ROOM_NAME: usize = 50;
const RESERVED_ROOM_NAMES: &[&str] = &[".", "..", "con", "prn", "aux", "nul"];

/// Check a room name before it becomes a directory name
pub fn validate_room_name(name: &str) -> Result<(), SessionError> {
    let invalid = |reason: &str| SessionError::InvalidRoomName {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.chars().count() > MAX_ROOM_NAME {
        return Err(invalid("name is longer than 50 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(invalid("only letters, digits, '-' and '_' are allowed"));
    }
    if RESERVED_ROOM_NAMES.contains(&name.to_lowercase().as_str()) {
        return Err(invalid("name is reserved"));
    }
    Ok(())
}

/// Exclusive lock on a room: an OS advisory lock on `<rooms_dir>/<room>/.lock`.
///
/// The lock belongs to the open file, so a crashed or killed session releases
/// it with the process. The file itself stays behind and only carries the
/// holder's pid for error messages.
#[derive(Debug)]
pub struct RoomLock {
    path: PathBuf,
    file: File,
}

impl RoomLock {
    pub fn acquire(rooms_dir: &Path, room: &str) -> Result<Self, SessionError> {
        let dir = rooms_dir.join(room);
        fs::create_dir_all(&dir)?;
        let path = dir.join(".lock");

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() != fs2::lock_contended_error().kind() {
                return Err(e.into());
            }
            let holder = fs::read_to_string(&path)
                .ok()
                .map(|pid| pid.trim().to_string())
                .filter(|pid| !pid.is_empty())
                .map(|pid| format!("pid {pid}"))
                .unwrap_or_else(|| "unknown holder".to_string());
            return Err(SessionError::RoomLocked {
                room: room.to_string(),
                holder,
            });
        }

        // a stale pid from a crashed holder may still be there
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;
        debug!("Locked room '{}' at {}", room, path.display());
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RoomLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release room lock {}: {}", self.path.display(), e);
        }
    }
}

/// What one line of input produced
#[derive(Debug)]
pub enum SessionReply {
    Turn(TurnReport),
    Batch(BatchReport),
    Notice(String),
    /// Session closed; `dropped` queued operations were denied
    Exit { dropped: usize },
    Ignored,
}

pub struct RoomSession {
    id: Uuid,
    room: String,
    permissions: PermissionEngine,
    default_agent: String,
    export_dir: PathBuf,
    closed: bool,
    _lock: RoomLock,
}

impl RoomSession {
    /// Lock `room` and start a session on it. An empty room log gets a
    /// system intro message first.
    pub async fn open(
        room: &str,
        rooms_dir: &Path,
        dispatcher: &Dispatcher,
        permissions: PermissionEngine,
    ) -> Result<Self, SessionError> {
        validate_room_name(room)?;
        let lock = RoomLock::acquire(rooms_dir, room)?;

        let history = dispatcher.history();
        let existing = history.load(room).await.map_err(DispatchError::history)?;
        if existing.is_empty() {
            let agents = dispatcher.agents();
            let intro = Message::system(format!(
                "Room '{}' opened. Agents: {}. Default agent: @{}.",
                room,
                agents
                    .list_agents()
                    .iter()
                    .map(|a| format!("@{a}"))
                    .collect::<Vec<_>>()
                    .join(", "),
                agents.default_agent()
            ))
            .with_metadata("kind", "room-intro");
            history
                .append(room, intro)
                .await
                .map_err(DispatchError::history)?;
        }

        let id = Uuid::new_v4();
        info!(
            "Session {} opened room '{}' ({} messages, mode {})",
            id,
            room,
            existing.len(),
            permissions.mode()
        );

        Ok(Self {
            id,
            room: room.to_string(),
            permissions,
            default_agent: dispatcher.agents().default_agent().to_string(),
            export_dir: rooms_dir.join(room).join("exports"),
            closed: false,
            _lock: lock,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn default_agent(&self) -> &str {
        &self.default_agent
    }

    pub fn permissions(&self) -> &PermissionEngine {
        &self.permissions
    }

    pub fn permissions_mut(&mut self) -> &mut PermissionEngine {
        &mut self.permissions
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Handle one line: a directive, or a message for the dispatcher
    pub async fn handle_input(
        &mut self,
        dispatcher: &Dispatcher,
        line: &str,
        cancel: &CancellationToken,
    ) -> Result<SessionReply, SessionError> {
        if self.closed {
            return Ok(SessionReply::Notice("Session is closed.".to_string()));
        }
        match parse_input(line) {
            Err(e) => Ok(SessionReply::Notice(e.to_string())),
            Ok(Input::Ignore) => Ok(SessionReply::Ignored),
            Ok(Input::Message(text)) => {
                let report = dispatcher
                    .dispatch(
                        &self.room,
                        &mut self.permissions,
                        &text,
                        Some(&self.default_agent),
                        cancel,
                    )
                    .await?;
                Ok(SessionReply::Turn(report))
            }
            Ok(Input::Directive(directive)) => self.apply(dispatcher, directive).await,
        }
    }

    async fn apply(
        &mut self,
        dispatcher: &Dispatcher,
        directive: Directive,
    ) -> Result<SessionReply, SessionError> {
        debug!("Session {} directive {:?}", self.id, directive);
        let notice = match directive {
            Directive::Trust { agent, minutes } => {
                let agent = agent.unwrap_or_else(|| self.default_agent.clone());
                if let Some(unknown) = unknown_agent(dispatcher, &agent) {
                    unknown
                } else {
                    let granted = self.permissions.trust(&agent, minutes);
                    format!("@{} is trusted for {} minutes.", agent, granted.as_secs() / 60)
                }
            }
            Directive::Untrust { agent } => {
                let agent = agent.unwrap_or_else(|| self.default_agent.clone());
                if self.permissions.untrust(&agent) {
                    format!("Trust revoked for @{agent}.")
                } else {
                    format!("@{agent} was not trusted.")
                }
            }
            Directive::Approve => return self.resolve(dispatcher, BatchChoice::ApproveAll).await,
            Directive::Deny => return self.resolve(dispatcher, BatchChoice::DenyAll).await,
            Directive::Review => return self.resolve(dispatcher, BatchChoice::Review).await,
            Directive::Agent(name) => {
                if let Some(unknown) = unknown_agent(dispatcher, &name) {
                    unknown
                } else {
                    self.default_agent = name;
                    format!("Default agent is now @{}.", self.default_agent)
                }
            }
            Directive::Batch(on) => {
                self.permissions.set_batch_mode(on);
                let pending = self.permissions.pending().len();
                match (on, pending) {
                    (true, _) => "Batch mode on: confirmations will be queued.".to_string(),
                    (false, 0) => "Batch mode off.".to_string(),
                    (false, n) => format!(
                        "Batch mode off. {n} queued operations still wait for /approve, /deny or /review."
                    ),
                }
            }
            Directive::Agents => dispatcher
                .agents()
                .list_agents()
                .iter()
                .map(|name| {
                    let mut line = format!("@{name}");
                    if *name == self.default_agent {
                        line.push_str(" (default)");
                    }
                    if self.permissions.is_trusted(name) {
                        let mins = self.permissions.trust_remaining(name).as_secs().div_ceil(60);
                        line.push_str(&format!(" [trusted, {mins} min left]"));
                    }
                    line
                })
                .collect::<Vec<_>>()
                .join("\n"),
            Directive::Status => format!(
                "Room: {}\nDefault agent: @{}\nPermission mode: {}\nBatch mode: {}\nPending operations: {}\nTrusted: {}",
                self.room,
                self.default_agent,
                self.permissions.mode(),
                if self.permissions.batch_mode() { "on" } else { "off" },
                self.permissions.pending().len(),
                match self.permissions.trusted_agents() {
                    agents if agents.is_empty() => "nobody".to_string(),
                    agents => agents.iter().map(|a| format!("@{a}")).collect::<Vec<_>>().join(", "),
                }
            ),
            Directive::Export => {
                match export_room(dispatcher.history().as_ref(), &self.room, &self.export_dir).await {
                    Ok(path) => format!("Transcript written to {}", path.display()),
                    Err(e) => format!("Export failed: {e:#}"),
                }
            }
            Directive::Help => HELP.to_string(),
            Directive::Exit => {
                return Ok(SessionReply::Exit {
                    dropped: self.close(),
                });
            }
        };
        Ok(SessionReply::Notice(notice))
    }

    async fn resolve(
        &mut self,
        dispatcher: &Dispatcher,
        choice: BatchChoice,
    ) -> Result<SessionReply, SessionError> {
        if self.permissions.pending().is_empty() {
            return Ok(SessionReply::Notice("No pending operations.".to_string()));
        }
        let report = self
            .permissions
            .resolve_batch(
                choice,
                dispatcher.tools().as_ref(),
                dispatcher.confirmation().as_ref(),
            )
            .await;

        // agents see the outcome on their next turn
        let record = Message::system(report.render()).with_metadata("kind", "batch-result");
        dispatcher
            .history()
            .append(&self.room, record)
            .await
            .map_err(DispatchError::history)?;
        Ok(SessionReply::Batch(report))
    }

    /// End the session. Unresolved batch operations are denied.
    pub fn close(&mut self) -> usize {
        if self.closed {
            return 0;
        }
        self.closed = true;
        let dropped = self.permissions.shutdown();
        info!("Session {} closed room '{}'", self.id, self.room);
        dropped
    }
}

fn unknown_agent(dispatcher: &Dispatcher, name: &str) -> Option<String> {
    if dispatcher.agents().contains(name) {
        return None;
    }
    Some(
        DispatchError::UnknownAgent {
            name: name.to_string(),
            suggestion: dispatcher.agents().suggest(name),
        }
        .to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentManager, AgentProfile};
    use crate::clock::ManualClock;
    use crate::error::ProviderError;
    use crate::history::{HistoryStore, InMemoryHistory};
    use crate::permissions::{AutoDeny, PermissionConfig, PermissionMode};
    use crate::providers::{ProviderAdapter, ProviderRegistry, ProviderReply, ToolCall, ToolDefinition};
    use crate::tools::FileSystemExecutor;
    use crate::types::Role;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    /// Writes `out.txt` on its first call, then just talks
    struct WritingProvider {
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl ProviderAdapter for WritingProvider {
        fn provider_name(&self) -> &str {
            "mock"
        }
        fn describe_model(&self) -> String {
            "mock-1".to_string()
        }
        fn requires_tool_followup(&self) -> bool {
            false
        }
        async fn send(
            &self,
            _messages: &[Message],
            _system_prompt: &str,
            _tools: &[ToolDefinition],
        ) -> Result<ProviderReply, ProviderError> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            if *calls == 1 {
                return Ok(ProviderReply::text("writing").with_tool_call(ToolCall {
                    id: "w1".to_string(),
                    name: "write_file".to_string(),
                    input: serde_json::json!({"path": "out.txt", "content": "done"}),
                }));
            }
            Ok(ProviderReply::text("hello"))
        }
    }

    struct Fixture {
        rooms: TempDir,
        work: TempDir,
        history: Arc<InMemoryHistory>,
        dispatcher: Dispatcher,
    }

    impl Fixture {
        fn new() -> Self {
            let rooms = TempDir::new().unwrap();
            let work = TempDir::new().unwrap();
            let history = Arc::new(InMemoryHistory::new());
            let mut agents = AgentManager::new(AgentProfile::new("Architect", "mock", "gpt-4o"));
            agents.add_profile(AgentProfile::new("Coder", "mock", "gpt-4o"));
            let providers = ProviderRegistry::new()
                .with_adapter("Architect", Arc::new(WritingProvider { calls: Mutex::new(0) }))
                .with_adapter("Coder", Arc::new(WritingProvider { calls: Mutex::new(0) }));
            let dispatcher = Dispatcher::new(
                agents,
                providers,
                history.clone(),
                Arc::new(FileSystemExecutor::new(work.path())),
            )
            .with_confirmation(Arc::new(AutoDeny));
            Self {
                rooms,
                work,
                history,
                dispatcher,
            }
        }

        fn engine(&self, mode: PermissionMode) -> PermissionEngine {
            let config = PermissionConfig {
                mode,
                ..PermissionConfig::default()
            };
            PermissionEngine::new(&config, self.work.path(), Arc::new(ManualClock::new()))
        }

        async fn open(&self, mode: PermissionMode) -> Result<RoomSession, SessionError> {
            RoomSession::open("dev", self.rooms.path(), &self.dispatcher, self.engine(mode)).await
        }

        async fn notice(&self, session: &mut RoomSession, line: &str) -> String {
            match session
                .handle_input(&self.dispatcher, line, &CancellationToken::new())
                .await
                .unwrap()
            {
                SessionReply::Notice(text) => text,
                other => panic!("expected notice, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_validate_room_name() {
        assert!(validate_room_name("project-x_2").is_ok());
        assert!(validate_room_name("").is_err());
        assert!(validate_room_name("..").is_err());
        assert!(validate_room_name("a/b").is_err());
        assert!(validate_room_name("CON").is_err());
        assert!(validate_room_name(&"r".repeat(51)).is_err());
        assert!(validate_room_name(&"r".repeat(50)).is_ok());
    }

    #[tokio::test]
    async fn test_open_writes_intro_once() {
        let fx = Fixture::new();
        let session = fx.open(PermissionMode::Selective).await.unwrap();
        assert!(session.default_agent() == "Architect");
        drop(session);
        let _again = fx.open(PermissionMode::Selective).await.unwrap();

        let log = fx.history.load("dev").await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].role, Role::System);
        assert_eq!(log[0].metadata["kind"], "room-intro");
        assert!(log[0].content.contains("@Coder"));
    }

    #[tokio::test]
    async fn test_second_session_is_locked_out() {
        let fx = Fixture::new();
        let first = fx.open(PermissionMode::Selective).await.unwrap();
        let lock_path = fx.rooms.path().join("dev").join(".lock");
        assert!(lock_path.exists());

        match fx.open(PermissionMode::Selective).await {
            Err(SessionError::RoomLocked { room, holder }) => {
                assert_eq!(room, "dev");
                assert!(holder.starts_with("pid "));
            }
            Err(e) => panic!("expected RoomLocked, got {e}"),
            Ok(_) => panic!("expected RoomLocked, got a session"),
        }

        drop(first);
        assert!(fx.open(PermissionMode::Selective).await.is_ok());
    }

    #[test]
    fn test_lock_left_by_dead_process_is_reclaimed() {
        let rooms = TempDir::new().unwrap();
        let dir = rooms.path().join("r");
        std::fs::create_dir_all(&dir).unwrap();
        // a killed session leaves its lock file behind but no OS lock
        std::fs::write(dir.join(".lock"), "4170\n").unwrap();

        let lock = RoomLock::acquire(rooms.path(), "r").unwrap();
        let pid = std::fs::read_to_string(lock.path()).unwrap();
        assert_eq!(pid.trim(), std::process::id().to_string());

        match RoomLock::acquire(rooms.path(), "r") {
            Err(SessionError::RoomLocked { holder, .. }) => {
                assert_eq!(holder, format!("pid {}", std::process::id()));
            }
            other => panic!("expected RoomLocked, got {other:?}"),
        }

        drop(lock);
        assert!(RoomLock::acquire(rooms.path(), "r").is_ok());
    }

    #[tokio::test]
    async fn test_invalid_room_rejected_before_lock() {
        let fx = Fixture::new();
        let err = RoomSession::open(
            "../etc",
            fx.rooms.path(),
            &fx.dispatcher,
            fx.engine(PermissionMode::Selective),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, SessionError::InvalidRoomName { .. }));
    }

    #[tokio::test]
    async fn test_agent_directive_changes_default_route() {
        let fx = Fixture::new();
        let mut session = fx.open(PermissionMode::Trusted).await.unwrap();
        assert!(fx.notice(&mut session, "/agent @Coder").await.contains("@Coder"));
        assert!(fx.notice(&mut session, "/agent Codr").await.contains("did you mean '@Coder'"));

        let reply = session
            .handle_input(&fx.dispatcher, "write it", &CancellationToken::new())
            .await
            .unwrap();
        let SessionReply::Turn(report) = reply else {
            panic!("expected a turn");
        };
        assert_eq!(report.outcomes[0].agent, "Coder");
    }

    #[tokio::test]
    async fn test_trust_directives() {
        let fx = Fixture::new();
        let mut session = fx.open(PermissionMode::AlwaysAsk).await.unwrap();
        assert_eq!(
            fx.notice(&mut session, "/trust 15").await,
            "@Architect is trusted for 15 minutes."
        );
        assert!(session.permissions_mut().is_trusted("Architect"));
        assert!(fx.notice(&mut session, "/status").await.contains("Trusted: @Architect"));
        assert_eq!(
            fx.notice(&mut session, "/untrust @Architect").await,
            "Trust revoked for @Architect."
        );
        assert!(fx.notice(&mut session, "/trust @Nobody").await.contains("unknown agent"));
    }

    #[tokio::test]
    async fn test_batch_queue_then_approve() {
        let fx = Fixture::new();
        let mut session = fx.open(PermissionMode::AlwaysAsk).await.unwrap();
        fx.notice(&mut session, "/batch on").await;

        let reply = session
            .handle_input(&fx.dispatcher, "@Coder write the file", &CancellationToken::new())
            .await
            .unwrap();
        let SessionReply::Turn(report) = reply else {
            panic!("expected a turn");
        };
        assert_eq!(report.queued(), 1);
        assert!(!fx.work.path().join("out.txt").exists());

        let reply = session
            .handle_input(&fx.dispatcher, "/approve", &CancellationToken::new())
            .await
            .unwrap();
        let SessionReply::Batch(batch) = reply else {
            panic!("expected a batch report");
        };
        assert_eq!(batch.executed(), 1);
        assert!(fx.work.path().join("out.txt").exists());
        assert!(session.permissions().pending().is_empty());
        assert_eq!(fx.notice(&mut session, "/approve").await, "No pending operations.");

        let log = fx.history.load("dev").await.unwrap();
        assert_eq!(log.last().unwrap().metadata["kind"], "batch-result");
    }

    #[tokio::test]
    async fn test_export_directive_writes_transcript() {
        let fx = Fixture::new();
        let mut session = fx.open(PermissionMode::Selective).await.unwrap();
        let notice = fx.notice(&mut session, "/export").await;
        assert!(notice.starts_with("Transcript written to "));

        let exports = fx.rooms.path().join("dev").join("exports");
        let files: Vec<_> = std::fs::read_dir(&exports).unwrap().collect();
        assert_eq!(files.len(), 1);
        let body = std::fs::read_to_string(files[0].as_ref().unwrap().path()).unwrap();
        assert!(body.contains("Room 'dev' opened."));
    }

    #[tokio::test]
    async fn test_exit_denies_pending() {
        let fx = Fixture::new();
        let mut session = fx.open(PermissionMode::AlwaysAsk).await.unwrap();
        fx.notice(&mut session, "/batch on").await;
        session
            .handle_input(&fx.dispatcher, "@Coder write", &CancellationToken::new())
            .await
            .unwrap();

        let reply = session
            .handle_input(&fx.dispatcher, "/exit", &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(reply, SessionReply::Exit { dropped: 1 }));
        assert!(session.is_closed());
        assert_eq!(session.close(), 0);
    }

    #[tokio::test]
    async fn test_routing_errors_surface_as_errors() {
        let fx = Fixture::new();
        let mut session = fx.open(PermissionMode::Selective).await.unwrap();
        let err = session
            .handle_input(&fx.dispatcher, "@Ghost hello", &CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::Dispatch(DispatchError::UnknownAgent { .. })));
        assert!(matches!(
            session
                .handle_input(&fx.dispatcher, "   ", &CancellationToken::new())
                .await
                .unwrap(),
            SessionReply::Ignored
        ));
    }
}
