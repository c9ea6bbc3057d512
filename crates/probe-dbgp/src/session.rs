//! The debug-session state machine.
//!
//! A [`Session`] composes the listener, connection, transaction engine
//! and breakpoint store into one lifecycle: idle → listening →
//! connecting → active (running or break) → idle again on teardown.
//! Many sessions can follow one another; breakpoint intent survives
//! between them, negotiated engine state never does.

use std::fmt;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::api::Api;
use crate::breakpoint::{Breakpoint, BreakpointKind, BreakpointStore};
use crate::connection::Connection;
use crate::error::DbgpError;
use crate::listener::Listener;
use crate::path::PathMap;
use crate::protocol::{Response, Status, StatusResponse};

/// Whether the attached engine is executing or paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// The engine is executing; only status queries make sense.
    Running,
    /// The engine is paused and accepting inspection/step commands.
    Break,
}

/// Lifecycle state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No engine attached, not waiting for one.
    Idle,
    /// The listener is accepting in the background.
    Listening,
    /// A peer was accepted; the handshake has not completed.
    Connecting,
    /// Handshake done; an engine is attached.
    Active(RunState),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Listening => "listening",
            SessionState::Connecting => "connecting",
            SessionState::Active(RunState::Running) => "running",
            SessionState::Active(RunState::Break) => "break",
        };
        f.write_str(name)
    }
}

/// A source position reported by the engine, mapped to a local path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
}

/// The rendering collaborator: everything the session surfaces to the
/// user goes through here.
pub trait Render {
    /// The engine reported a new status token.
    fn status(&mut self, status: &str);
    /// The current source position changed.
    fn location(&mut self, location: &SourceLocation);
    /// A stack_get response to display.
    fn stack(&mut self, response: &Response);
    /// A context_get response to display.
    fn context(&mut self, response: &Response);
    /// A property_get or eval response to display.
    fn value(&mut self, response: &Response);
    /// Informational text.
    fn message(&mut self, text: &str);
    /// Error text. The session reports every error it swallows here;
    /// errors it returns are the caller's to report.
    fn error(&mut self, text: &str);
}

/// Tunables for a session, usually derived from configuration.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Interface to listen on; empty means all interfaces.
    pub host: String,
    /// Port the engine dials.
    pub port: u16,
    /// How long to wait for an engine before giving up.
    pub accept_timeout: Duration,
    /// Bound on each response wait. `None` blocks indefinitely.
    pub response_timeout: Option<Duration>,
    /// Expected IDE key; any engine announcing another is refused.
    pub ide_key: Option<String>,
    /// Features to negotiate after each handshake.
    pub features: Vec<(String, String)>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 9000,
            accept_timeout: Duration::from_secs(30),
            response_timeout: None,
            ide_key: None,
            features: vec![
                ("max_depth".to_string(), "1".to_string()),
                ("max_children".to_string(), "32".to_string()),
                ("max_data".to_string(), "512".to_string()),
            ],
        }
    }
}

/// One debugging client: listener, live connection, breakpoint intent.
pub struct Session {
    options: SessionOptions,
    state: SessionState,
    listener: Listener,
    api: Option<Api>,
    breakpoints: BreakpointStore,
    renderer: Box<dyn Render>,
    paths: Box<dyn PathMap>,
    location: Option<SourceLocation>,
}

impl Session {
    pub fn new(
        options: SessionOptions,
        renderer: Box<dyn Render>,
        paths: Box<dyn PathMap>,
    ) -> Self {
        Self {
            options,
            state: SessionState::Idle,
            listener: Listener::new(),
            api: None,
            breakpoints: BreakpointStore::new(),
            renderer,
            paths,
            location: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether an engine is attached.
    pub fn is_connected(&self) -> bool {
        matches!(self.state, SessionState::Active(_))
    }

    /// The source position the engine last reported.
    pub fn location(&self) -> Option<&SourceLocation> {
        self.location.as_ref()
    }

    /// Language negotiated in the handshake, while attached.
    pub fn language(&self) -> Option<&str> {
        self.api.as_ref().map(Api::language)
    }

    /// Read access to the breakpoint store.
    pub fn breakpoints(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.iter()
    }

    /// Start waiting for an engine in the background.
    ///
    /// A second call while already listening is a no-op that reports
    /// the existing wait; while attached it reports the live session.
    pub fn listen(&mut self) -> Result<(), DbgpError> {
        match self.state {
            SessionState::Idle => {
                self.listener.start(
                    &self.options.host,
                    self.options.port,
                    self.options.accept_timeout,
                )?;
                self.state = SessionState::Listening;
                self.renderer
                    .message("waiting for a debugger connection in the background");
                Ok(())
            }
            SessionState::Listening => {
                self.renderer
                    .message("already waiting for a connection: none found so far");
                Ok(())
            }
            SessionState::Connecting | SessionState::Active(_) => {
                self.renderer.message("a debugging session is already active");
                Ok(())
            }
        }
    }

    /// Drive the background wait. Returns true once an engine is
    /// attached. A lapsed accept window surfaces as a timeout error and
    /// leaves the session idle; a later `listen` starts a fresh wait.
    pub fn poll(&mut self) -> Result<bool, DbgpError> {
        if self.state != SessionState::Listening {
            return Ok(self.is_connected());
        }
        match self.listener.poll() {
            Ok(Some(connection)) => {
                self.connect(connection)?;
                Ok(self.is_connected())
            }
            Ok(None) => Ok(false),
            Err(e) => {
                self.state = SessionState::Idle;
                Err(e)
            }
        }
    }

    /// Cancel a background wait without error.
    pub fn cancel_listen(&mut self) {
        if self.state == SessionState::Listening {
            self.listener.stop();
            self.state = SessionState::Idle;
            self.renderer.message("connection wait cancelled");
        }
    }

    /// Attach to an accepted connection: handshake, feature
    /// negotiation, breakpoint replay.
    ///
    /// On handshake failure the connection is discarded and the session
    /// returns to idle.
    pub fn connect(&mut self, mut connection: Connection) -> Result<(), DbgpError> {
        if self.is_connected() {
            return Err(self.invalid("connect"));
        }
        self.state = SessionState::Connecting;
        if let Err(e) = connection.set_read_timeout(self.options.response_timeout) {
            self.state = SessionState::Idle;
            return Err(e);
        }

        let api = match Api::attach(connection, self.options.ide_key.as_deref()) {
            Ok(api) => api,
            Err(mut failure) => {
                // Identity mismatches leave the connection open by
                // contract; this client has no further use for it.
                failure.connection.close();
                self.state = SessionState::Idle;
                return Err(failure.error);
            }
        };
        info!(
            "engine attached: language={} idekey={}",
            api.language(),
            api.idekey()
        );
        let start_file = api.start_file().map(str::to_string);
        self.api = Some(api);
        // Engines announce while paused at the first executable line.
        self.state = SessionState::Active(RunState::Break);

        self.negotiate_features()?;
        self.replay_breakpoints()?;

        if let Some(uri) = start_file {
            let location = SourceLocation {
                file: self.paths.to_local(&uri),
                line: 1,
            };
            self.renderer.location(&location);
            self.location = Some(location);
        }
        self.renderer.status("break");
        Ok(())
    }

    /// Negotiate the configured features. Engine refusals are reported
    /// and skipped; only transport failures abort.
    fn negotiate_features(&mut self) -> Result<(), DbgpError> {
        let features = self.options.features.clone();
        for (name, value) in features {
            let Some(api) = self.api.as_mut() else { break };
            match api.feature_set(&name, &value) {
                Ok(_) => debug!("feature {name}={value} accepted"),
                Err(e) if e.is_fatal_to_session() => {
                    self.teardown();
                    return Err(e);
                }
                Err(e) => {
                    self.renderer
                        .error(&format!("engine rejected feature {name}: {e}"));
                }
            }
        }
        Ok(())
    }

    /// Install every enabled breakpoint on the freshly-attached engine.
    ///
    /// A rejected breakpoint is reported individually and the replay
    /// continues; the remote ids recorded always belong to this
    /// session, never a previous one.
    fn replay_breakpoints(&mut self) -> Result<(), DbgpError> {
        self.breakpoints.clear_remote_ids();
        for id in self.breakpoints.enabled_ids() {
            if let Err(e) = self.install_breakpoint(id) {
                if e.is_fatal_to_session() {
                    self.teardown();
                    return Err(e);
                }
                self.renderer
                    .error(&format!("breakpoint {id} was not installed: {e}"));
            }
        }
        Ok(())
    }

    /// Issue breakpoint_set for one record and capture the remote id.
    fn install_breakpoint(&mut self, id: u32) -> Result<(), DbgpError> {
        let Some(record) = self.breakpoints.get(id) else {
            return Ok(());
        };
        if !record.is_enabled() {
            return Ok(());
        }
        let args = record.command_args(self.paths.as_ref());
        let Some(api) = self.api.as_mut() else {
            return Ok(());
        };
        let response = api.breakpoint_set(&args)?;
        match response.attribute("id")? {
            Some(remote_id) => {
                self.breakpoints.set_remote_id(id, remote_id);
            }
            None => warn!("engine assigned no id to breakpoint {id}"),
        }
        Ok(())
    }

    /// Resume execution until the next breakpoint or end of script.
    pub fn run(&mut self) -> Result<Status, DbgpError> {
        self.execute("run", Api::run)
    }

    /// Step to the next statement, entering calls.
    pub fn step_into(&mut self) -> Result<Status, DbgpError> {
        self.execute("step_into", Api::step_into)
    }

    /// Step to the next statement in the current scope.
    pub fn step_over(&mut self) -> Result<Status, DbgpError> {
        self.execute("step_over", Api::step_over)
    }

    /// Step out of the current scope.
    pub fn step_out(&mut self) -> Result<Status, DbgpError> {
        self.execute("step_out", Api::step_out)
    }

    /// Issue one execution command and interpret the blocking status
    /// reply.
    fn execute<F>(&mut self, operation: &str, command: F) -> Result<Status, DbgpError>
    where
        F: FnOnce(&mut Api) -> Result<StatusResponse, DbgpError>,
    {
        self.require_break(operation)?;
        self.state = SessionState::Active(RunState::Running);
        let result = match self.api.as_mut() {
            Some(api) => command(api).and_then(|resp| resp.status()),
            None => Err(self.invalid(operation)),
        };
        match result {
            Ok(status) => self.apply_status(status),
            Err(e) => Err(self.fail_command(e)),
        }
    }

    /// Move the state machine according to an engine-reported status.
    fn apply_status(&mut self, status: Status) -> Result<Status, DbgpError> {
        self.renderer.status(&status.to_string());
        match status {
            Status::Break => {
                self.state = SessionState::Active(RunState::Break);
                self.refresh_location()?;
            }
            Status::Stopping | Status::Stopped => {
                self.renderer.message("debugging session has ended");
                self.teardown();
            }
            Status::Running | Status::Starting => {
                self.state = SessionState::Active(RunState::Running);
            }
        }
        Ok(status)
    }

    /// Ask the engine where it is paused and render the position.
    fn refresh_location(&mut self) -> Result<(), DbgpError> {
        let result = match self.api.as_mut() {
            Some(api) => api.stack_get(),
            None => return Ok(()),
        };
        let response = match result {
            Ok(response) => response,
            Err(e) if e.is_fatal_to_session() => return Err(self.fail_command(e)),
            Err(e) => {
                self.renderer
                    .error(&format!("could not read the call stack: {e}"));
                return Ok(());
            }
        };
        match top_frame_location(&response, self.paths.as_ref()) {
            Ok(Some(location)) => {
                self.renderer.location(&location);
                self.location = Some(location);
            }
            Ok(None) => {}
            Err(e) => return Err(self.fail_command(e)),
        }
        self.renderer.stack(&response);
        Ok(())
    }

    /// Query the engine status without moving execution.
    pub fn status(&mut self) -> Result<Status, DbgpError> {
        self.require_active("status")?;
        let result = match self.api.as_mut() {
            Some(api) => api.status().and_then(|resp| resp.status()),
            None => Err(self.invalid("status")),
        };
        match result {
            Ok(status) => {
                self.renderer.status(&status.to_string());
                if status.is_terminal() {
                    self.teardown();
                } else {
                    self.state = SessionState::Active(match status {
                        Status::Break | Status::Starting => RunState::Break,
                        _ => RunState::Running,
                    });
                }
                Ok(status)
            }
            Err(e) => Err(self.fail_command(e)),
        }
    }

    /// Fetch and render the call stack.
    pub fn stack(&mut self) -> Result<Response, DbgpError> {
        let response = self.inspect("stack_get", |api| api.stack_get())?;
        self.renderer.stack(&response);
        Ok(response)
    }

    /// Fetch and render the local context variables.
    pub fn context(&mut self) -> Result<Response, DbgpError> {
        let response = self.inspect("context_get", |api| api.context_get(0, 0))?;
        self.renderer.context(&response);
        Ok(response)
    }

    /// Fetch and render a single property.
    pub fn property(&mut self, name: &str) -> Result<Response, DbgpError> {
        let response = self.inspect("property_get", |api| api.property_get(name))?;
        self.renderer.value(&response);
        Ok(response)
    }

    /// Evaluate an expression and render the result.
    pub fn eval(&mut self, expression: &str) -> Result<Response, DbgpError> {
        let response = self.inspect("eval", |api| api.eval(expression))?;
        self.renderer.value(&response);
        Ok(response)
    }

    /// Shared guard and error handling for inspection commands.
    fn inspect<F>(&mut self, operation: &str, command: F) -> Result<Response, DbgpError>
    where
        F: FnOnce(&mut Api) -> Result<Response, DbgpError>,
    {
        self.require_break(operation)?;
        let result = match self.api.as_mut() {
            Some(api) => command(api),
            None => Err(self.invalid(operation)),
        };
        result.map_err(|e| self.fail_command(e))
    }

    /// Detach from the engine, leaving the debuggee running.
    pub fn detach(&mut self) -> Result<(), DbgpError> {
        self.require_active("detach")?;
        let result = match self.api.as_mut() {
            Some(api) => api.detach().map(|_| ()),
            None => Ok(()),
        };
        self.teardown();
        self.renderer.message("detached from the debugger engine");
        result
    }

    /// Terminate the debugged process and end the session.
    pub fn stop(&mut self) -> Result<(), DbgpError> {
        self.require_active("stop")?;
        let result = match self.api.as_mut() {
            Some(api) => api.stop().map(|_| ()),
            None => Ok(()),
        };
        self.teardown();
        self.renderer.message("debugged process stopped");
        result
    }

    /// Add a breakpoint. The local record is created unconditionally;
    /// if a session is attached the breakpoint is installed remotely and
    /// an engine refusal is reported without undoing the local add.
    pub fn add_breakpoint(&mut self, kind: BreakpointKind) -> Result<u32, DbgpError> {
        let id = self.breakpoints.add(kind);
        if self.is_connected() {
            if let Err(e) = self.install_breakpoint(id) {
                if e.is_fatal_to_session() {
                    self.teardown();
                    return Err(e);
                }
                self.renderer
                    .error(&format!("breakpoint {id} was not installed: {e}"));
            }
        }
        Ok(id)
    }

    /// Remove a breakpoint. The remote removal is attempted first when
    /// a session holds an installed copy; the local record is deleted
    /// regardless. Returns false for an unknown id.
    pub fn remove_breakpoint(&mut self, id: u32) -> Result<bool, DbgpError> {
        let Some(record) = self.breakpoints.get(id) else {
            return Ok(false);
        };
        let remote_id = record.remote_id().map(str::to_string);
        let mut fatal = None;
        if let Some(remote_id) = remote_id.filter(|_| self.is_connected()) {
            if let Some(api) = self.api.as_mut() {
                match api.breakpoint_remove(&remote_id) {
                    Ok(_) => {}
                    Err(e) if e.is_fatal_to_session() => fatal = Some(e),
                    Err(e) => self
                        .renderer
                        .error(&format!("engine refused to remove breakpoint {id}: {e}")),
                }
            }
        }
        self.breakpoints.remove(id);
        if let Some(e) = fatal {
            self.teardown();
            return Err(e);
        }
        Ok(true)
    }

    /// Enable or disable a breakpoint. Local intent is authoritative:
    /// the flag is flipped even when the remote update fails. Returns
    /// the new state, or `None` for an unknown id.
    pub fn set_breakpoint_enabled(
        &mut self,
        id: u32,
        enabled: bool,
    ) -> Result<Option<bool>, DbgpError> {
        if self.breakpoints.set_enabled(id, enabled).is_none() {
            return Ok(None);
        }
        self.sync_breakpoint_state(id, enabled)?;
        Ok(Some(enabled))
    }

    /// Flip a breakpoint's enabled flag, mirroring to the engine.
    pub fn toggle_breakpoint(&mut self, id: u32) -> Result<Option<bool>, DbgpError> {
        let Some(enabled) = self.breakpoints.toggle(id) else {
            return Ok(None);
        };
        self.sync_breakpoint_state(id, enabled)?;
        Ok(Some(enabled))
    }

    /// Push an enable/disable change to the attached engine, if any.
    fn sync_breakpoint_state(&mut self, id: u32, enabled: bool) -> Result<(), DbgpError> {
        if !self.is_connected() {
            return Ok(());
        }
        let remote_id = self
            .breakpoints
            .get(id)
            .and_then(|r| r.remote_id().map(str::to_string));
        let Some(remote_id) = remote_id else {
            // Not installed this session (e.g. added while disabled):
            // enabling means installing it now.
            if enabled {
                if let Err(e) = self.install_breakpoint(id) {
                    if e.is_fatal_to_session() {
                        self.teardown();
                        return Err(e);
                    }
                    self.renderer
                        .error(&format!("breakpoint {id} was not installed: {e}"));
                }
            }
            return Ok(());
        };
        let state = if enabled { "enabled" } else { "disabled" };
        let result = match self.api.as_mut() {
            Some(api) => api.breakpoint_update(&remote_id, &format!("-s {state}")),
            None => return Ok(()),
        };
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_fatal_to_session() => {
                self.teardown();
                Err(e)
            }
            Err(e) => {
                self.renderer
                    .error(&format!("engine refused breakpoint update {id}: {e}"));
                Ok(())
            }
        }
    }

    /// Tear everything down and return to idle. Safe from any state.
    pub fn close(&mut self) {
        if self.is_connected() || self.state == SessionState::Listening {
            self.renderer.message("debugging session closed");
        }
        self.teardown();
    }

    /// Reset to idle: connection closed, listener stopped, negotiated
    /// state and remote breakpoint ids discarded.
    fn teardown(&mut self) {
        if let Some(mut api) = self.api.take() {
            api.close();
        }
        self.listener.stop();
        self.breakpoints.clear_remote_ids();
        self.location = None;
        self.state = SessionState::Idle;
    }

    /// Route a failed command: transport-level failures reset the
    /// session, protocol errors leave it paused and usable.
    fn fail_command(&mut self, error: DbgpError) -> DbgpError {
        if error.is_fatal_to_session() {
            warn!("session reset: {error}");
            self.teardown();
        } else if self.is_connected() {
            self.state = SessionState::Active(RunState::Break);
        }
        error
    }

    fn require_break(&self, operation: &str) -> Result<(), DbgpError> {
        match self.state {
            SessionState::Active(RunState::Break) => Ok(()),
            _ => Err(self.invalid(operation)),
        }
    }

    fn require_active(&self, operation: &str) -> Result<(), DbgpError> {
        match self.state {
            SessionState::Active(_) => Ok(()),
            _ => Err(self.invalid(operation)),
        }
    }

    fn invalid(&self, operation: &str) -> DbgpError {
        DbgpError::InvalidState {
            operation: operation.to_string(),
            state: self.state.to_string(),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Pull the topmost frame's position out of a stack_get response.
fn top_frame_location(
    response: &Response,
    paths: &dyn PathMap,
) -> Result<Option<SourceLocation>, DbgpError> {
    let doc = response.document()?;
    let Some(frame) = doc
        .descendants()
        .find(|n| n.is_element() && n.has_tag_name("stack"))
    else {
        return Ok(None);
    };
    let (Some(filename), Some(lineno)) = (frame.attribute("filename"), frame.attribute("lineno"))
    else {
        return Ok(None);
    };
    let line = lineno
        .parse::<u32>()
        .map_err(|_| DbgpError::malformed("non-numeric lineno in stack frame", response.as_str()))?;
    Ok(Some(SourceLocation {
        file: paths.to_local(filename),
        line,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::PathMapper;
    use std::net::{TcpListener, TcpStream};
    use std::sync::{Arc, Mutex};
    use std::thread::JoinHandle;

    /// Renderer that records everything it is shown.
    #[derive(Default)]
    struct Recorder {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn handle(&self) -> Arc<Mutex<Vec<String>>> {
            Arc::clone(&self.events)
        }
    }

    impl Render for Recorder {
        fn status(&mut self, status: &str) {
            self.events.lock().unwrap().push(format!("status:{status}"));
        }
        fn location(&mut self, location: &SourceLocation) {
            self.events
                .lock()
                .unwrap()
                .push(format!("location:{}:{}", location.file, location.line));
        }
        fn stack(&mut self, _response: &Response) {
            self.events.lock().unwrap().push("stack".to_string());
        }
        fn context(&mut self, _response: &Response) {
            self.events.lock().unwrap().push("context".to_string());
        }
        fn value(&mut self, _response: &Response) {
            self.events.lock().unwrap().push("value".to_string());
        }
        fn message(&mut self, text: &str) {
            self.events.lock().unwrap().push(format!("message:{text}"));
        }
        fn error(&mut self, text: &str) {
            self.events.lock().unwrap().push(format!("error:{text}"));
        }
    }

    fn test_session() -> (Session, Arc<Mutex<Vec<String>>>) {
        let recorder = Recorder::default();
        let events = recorder.handle();
        let options = SessionOptions {
            features: Vec::new(),
            ..SessionOptions::default()
        };
        let session = Session::new(
            options,
            Box::new(recorder),
            Box::new(PathMapper::identity()),
        );
        (session, events)
    }

    const INIT: &str =
        r#"<init language="python" idekey="x" api_version="1.0" fileuri="file:///a.py"/>"#;

    /// Scripted engine over a loopback socket, as in the api tests.
    fn scripted_engine(
        init: &str,
        responses: Vec<String>,
    ) -> (Connection, JoinHandle<Vec<String>>) {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        let init = init.to_string();

        let handle = std::thread::spawn(move || {
            let engine = TcpStream::connect(addr).unwrap();
            let mut engine = Connection::from_stream(engine);
            engine.send(&init).unwrap();
            let mut seen = Vec::new();
            for response in responses {
                seen.push(engine.receive().unwrap());
                engine.send(&response).unwrap();
            }
            seen
        });

        let (stream, _) = server.accept().unwrap();
        (Connection::from_stream(stream), handle)
    }

    #[test]
    fn execution_commands_rejected_while_idle() {
        let (mut session, _) = test_session();
        assert_eq!(session.state(), SessionState::Idle);

        for result in [
            session.run(),
            session.step_into(),
            session.step_over(),
            session.step_out(),
        ] {
            assert!(matches!(result, Err(DbgpError::InvalidState { .. })));
        }
        assert!(matches!(
            session.eval("1+1"),
            Err(DbgpError::InvalidState { .. })
        ));
        assert!(matches!(
            session.stop(),
            Err(DbgpError::InvalidState { .. })
        ));
    }

    #[test]
    fn cancel_listen_returns_to_idle() {
        let (mut session, events) = test_session();
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        session.options.host = "127.0.0.1".to_string();
        session.options.port = probe.local_addr().unwrap().port();
        drop(probe);

        session.listen().unwrap();
        assert_eq!(session.state(), SessionState::Listening);

        session.cancel_listen();
        assert_eq!(session.state(), SessionState::Idle);
        assert!(events
            .lock()
            .unwrap()
            .contains(&"message:connection wait cancelled".to_string()));
    }

    #[test]
    fn connect_reaches_break_and_reports_entry_location() {
        let (mut session, events) = test_session();
        let (conn, engine) = scripted_engine(INIT, vec![]);

        session.connect(conn).unwrap();
        assert_eq!(session.state(), SessionState::Active(RunState::Break));
        assert_eq!(session.language(), Some("python"));
        assert_eq!(
            session.location(),
            Some(&SourceLocation {
                file: "/a.py".to_string(),
                line: 1
            })
        );

        let events = events.lock().unwrap();
        assert!(events.contains(&"location:/a.py:1".to_string()));
        assert!(events.contains(&"status:break".to_string()));
        drop(events);
        engine.join().unwrap();
    }

    #[test]
    fn handshake_identity_mismatch_discards_connection() {
        let (mut session, _) = test_session();
        session.options.ide_key = Some("expected".to_string());
        let (conn, engine) = scripted_engine(INIT, vec![]);

        let err = session.connect(conn).unwrap_err();
        assert!(matches!(err, DbgpError::IdentityMismatch { .. }));
        assert_eq!(session.state(), SessionState::Idle);
        engine.join().unwrap();
    }

    #[test]
    fn malformed_announce_returns_to_idle() {
        let (mut session, _) = test_session();
        let (conn, engine) = scripted_engine("<init/>", vec![]);

        let err = session.connect(conn).unwrap_err();
        assert!(matches!(err, DbgpError::MalformedResponse { .. }));
        assert_eq!(session.state(), SessionState::Idle);
        engine.join().unwrap();
    }

    #[test]
    fn replay_installs_each_enabled_breakpoint_with_fresh_remote_ids() {
        let (mut session, _) = test_session();
        let a = session
            .add_breakpoint(BreakpointKind::Line {
                path: "/a.py".to_string(),
                line: 10,
            })
            .unwrap();
        let b = session
            .add_breakpoint(BreakpointKind::Line {
                path: "/a.py".to_string(),
                line: 20,
            })
            .unwrap();
        let disabled = session
            .add_breakpoint(BreakpointKind::Line {
                path: "/a.py".to_string(),
                line: 30,
            })
            .unwrap();
        session.set_breakpoint_enabled(disabled, false).unwrap();

        let (conn, engine) = scripted_engine(
            INIT,
            vec![
                r#"<response transaction_id="1" id="101"/>"#.to_string(),
                r#"<response transaction_id="2" id="102"/>"#.to_string(),
            ],
        );
        session.connect(conn).unwrap();

        let remote =
            |session: &Session, id| -> Option<String> {
                session
                    .breakpoints()
                    .find(|bp| bp.id() == id)
                    .and_then(|bp| bp.remote_id().map(str::to_string))
            };
        assert_eq!(remote(&session, a).as_deref(), Some("101"));
        assert_eq!(remote(&session, b).as_deref(), Some("102"));
        assert_eq!(remote(&session, disabled), None);

        // Exactly two set commands, in stable id order.
        let seen = engine.join().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].starts_with("breakpoint_set -i 1 -t line -f file:///a.py -n 10"));
        assert!(seen[1].starts_with("breakpoint_set -i 2 -t line -f file:///a.py -n 20"));
    }

    #[test]
    fn replay_continues_past_a_rejected_breakpoint() {
        let (mut session, events) = test_session();
        let a = session
            .add_breakpoint(BreakpointKind::Line {
                path: "/a.py".to_string(),
                line: 1,
            })
            .unwrap();
        let b = session
            .add_breakpoint(BreakpointKind::Line {
                path: "/a.py".to_string(),
                line: 2,
            })
            .unwrap();

        let (conn, engine) = scripted_engine(
            INIT,
            vec![
                r#"<response transaction_id="1"><error code="200"><message>refused</message></error></response>"#
                    .to_string(),
                r#"<response transaction_id="2" id="55"/>"#.to_string(),
            ],
        );
        session.connect(conn).unwrap();
        assert_eq!(session.state(), SessionState::Active(RunState::Break));

        let remote_of = |id| {
            session
                .breakpoints()
                .find(|bp| bp.id() == id)
                .and_then(|bp| bp.remote_id().map(str::to_string))
        };
        assert_eq!(remote_of(a), None);
        assert_eq!(remote_of(b).as_deref(), Some("55"));
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.starts_with("error:breakpoint")));
        engine.join().unwrap();
    }

    #[test]
    fn run_to_break_refreshes_location() {
        let (mut session, events) = test_session();
        let (conn, engine) = scripted_engine(
            INIT,
            vec![
                r#"<response status="break" transaction_id="1"/>"#.to_string(),
                r#"<response command="stack_get" transaction_id="2"><stack level="0" type="file" filename="file:///a.py" lineno="12" where="main"/></response>"#
                    .to_string(),
            ],
        );
        session.connect(conn).unwrap();

        let status = session.run().unwrap();
        assert_eq!(status, Status::Break);
        assert_eq!(session.state(), SessionState::Active(RunState::Break));
        assert_eq!(
            session.location(),
            Some(&SourceLocation {
                file: "/a.py".to_string(),
                line: 12
            })
        );
        assert!(events.lock().unwrap().contains(&"stack".to_string()));

        let seen = engine.join().unwrap();
        assert_eq!(seen, vec!["run -i 1", "stack_get -i 2"]);
    }

    #[test]
    fn garbled_stack_frame_after_break_tears_down() {
        let (mut session, _) = test_session();
        let (conn, engine) = scripted_engine(
            INIT,
            vec![
                r#"<response status="break" transaction_id="1"/>"#.to_string(),
                r#"<response command="stack_get" transaction_id="2"><stack level="0" type="file" filename="file:///a.py" lineno="xx" where="main"/></response>"#
                    .to_string(),
            ],
        );
        session.connect(conn).unwrap();

        let err = session.run().unwrap_err();
        assert!(matches!(err, DbgpError::MalformedResponse { .. }));
        assert!(err.is_fatal_to_session());
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.is_connected());
        engine.join().unwrap();
    }

    #[test]
    fn terminal_status_closes_the_session() {
        let (mut session, _) = test_session();
        let (conn, engine) = scripted_engine(
            INIT,
            vec![r#"<response status="stopping" transaction_id="1"/>"#.to_string()],
        );
        session.connect(conn).unwrap();

        let status = session.run().unwrap();
        assert_eq!(status, Status::Stopping);
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.is_connected());
        // Remote ids were discarded with the session.
        assert!(session.breakpoints().all(|bp| bp.remote_id().is_none()));
        engine.join().unwrap();
    }

    #[test]
    fn protocol_error_leaves_session_paused() {
        let (mut session, _) = test_session();
        let (conn, engine) = scripted_engine(
            INIT,
            vec![
                r#"<response transaction_id="1"><error code="206"><message>Error evaluating code</message></error></response>"#
                    .to_string(),
                r#"<response transaction_id="2"/>"#.to_string(),
            ],
        );
        session.connect(conn).unwrap();

        let err = session.eval("broken(").unwrap_err();
        assert!(matches!(err, DbgpError::Protocol { code: 206, .. }));
        // Still attached: the next command goes through.
        assert_eq!(session.state(), SessionState::Active(RunState::Break));
        session.eval("1 + 1").unwrap();
        engine.join().unwrap();
    }

    #[test]
    fn transport_failure_resets_to_idle() {
        let (mut session, _) = test_session();
        let (conn, engine) = scripted_engine(INIT, vec![]);
        session.connect(conn).unwrap();
        engine.join().unwrap();

        let err = session.step_over().unwrap_err();
        assert!(err.is_fatal_to_session(), "got: {err}");
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn remove_issues_remote_removal_before_deleting_locally() {
        let (mut session, _) = test_session();
        let id = session
            .add_breakpoint(BreakpointKind::Line {
                path: "/a.py".to_string(),
                line: 10,
            })
            .unwrap();

        let (conn, engine) = scripted_engine(
            INIT,
            vec![
                r#"<response transaction_id="1" id="77"/>"#.to_string(),
                r#"<response transaction_id="2"/>"#.to_string(),
            ],
        );
        session.connect(conn).unwrap();

        assert!(session.remove_breakpoint(id).unwrap());
        assert_eq!(session.breakpoints().count(), 0);

        let seen = engine.join().unwrap();
        assert_eq!(seen[1], "breakpoint_remove -i 2 -d 77");
    }

    #[test]
    fn remove_without_session_succeeds_locally() {
        let (mut session, _) = test_session();
        let id = session
            .add_breakpoint(BreakpointKind::Line {
                path: "/a.py".to_string(),
                line: 10,
            })
            .unwrap();
        assert!(session.remove_breakpoint(id).unwrap());
        assert!(!session.remove_breakpoint(id).unwrap());
    }

    #[test]
    fn toggle_keeps_local_change_when_engine_refuses() {
        let (mut session, events) = test_session();
        let id = session
            .add_breakpoint(BreakpointKind::Line {
                path: "/a.py".to_string(),
                line: 10,
            })
            .unwrap();

        let (conn, engine) = scripted_engine(
            INIT,
            vec![
                r#"<response transaction_id="1" id="9"/>"#.to_string(),
                r#"<response transaction_id="2"><error code="204"><message>bad state</message></error></response>"#
                    .to_string(),
            ],
        );
        session.connect(conn).unwrap();

        let enabled = session.toggle_breakpoint(id).unwrap();
        assert_eq!(enabled, Some(false));
        // Local intent is authoritative: the flag stays flipped.
        assert!(!session
            .breakpoints()
            .find(|bp| bp.id() == id)
            .unwrap()
            .is_enabled());
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.starts_with("error:engine refused breakpoint update")));

        let seen = engine.join().unwrap();
        assert_eq!(seen[1], "breakpoint_update -i 2 -d 9 -s disabled");
    }

    #[test]
    fn detach_terminates_to_idle() {
        let (mut session, _) = test_session();
        let (conn, engine) = scripted_engine(
            INIT,
            vec![r#"<response status="stopping" transaction_id="1"/>"#.to_string()],
        );
        session.connect(conn).unwrap();

        session.detach().unwrap();
        assert_eq!(session.state(), SessionState::Idle);

        let seen = engine.join().unwrap();
        assert_eq!(seen, vec!["detach -i 1"]);
    }

    #[test]
    fn close_is_safe_from_any_state() {
        let (mut session, _) = test_session();
        session.close();
        assert_eq!(session.state(), SessionState::Idle);

        let (conn, engine) = scripted_engine(INIT, vec![]);
        session.connect(conn).unwrap();
        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Idle);
        engine.join().unwrap();
    }
}
