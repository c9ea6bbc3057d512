//! The DBGP transaction engine.
//!
//! An [`Api`] owns an established [`Connection`], performs the init
//! handshake on construction, and exchanges exactly one command/response
//! pair at a time with monotonically increasing transaction ids.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::debug;

use crate::connection::Connection;
use crate::error::DbgpError;
use crate::protocol::{FeatureResponse, Init, Response, StatusResponse};

/// A failed handshake, carrying the still-open connection back to the
/// caller so it can decide whether to close it.
#[derive(Debug)]
pub struct HandshakeFailure {
    /// What went wrong.
    pub error: DbgpError,
    /// The connection the handshake was attempted on.
    pub connection: Connection,
}

/// Command/response interface to one debugger engine.
#[derive(Debug)]
pub struct Api {
    conn: Connection,
    transaction_id: u32,
    init: Init,
}

impl Api {
    /// Perform the init handshake over an established connection.
    ///
    /// The engine speaks first: one unsolicited message announcing its
    /// identity and initial paused location. If `expected_idekey` is
    /// given and the announced key differs, the handshake fails with an
    /// identity mismatch and the connection is handed back unopened.
    pub fn attach(
        mut conn: Connection,
        expected_idekey: Option<&str>,
    ) -> Result<Self, HandshakeFailure> {
        let raw = match conn.receive() {
            Ok(raw) => raw,
            Err(error) => return Err(HandshakeFailure { error, connection: conn }),
        };
        debug!("init: {raw}");
        let init = match Init::parse(&raw) {
            Ok(init) => init,
            Err(error) => return Err(HandshakeFailure { error, connection: conn }),
        };
        if let Some(expected) = expected_idekey {
            if init.idekey != expected {
                return Err(HandshakeFailure {
                    error: DbgpError::IdentityMismatch {
                        expected: expected.to_string(),
                        actual: init.idekey.clone(),
                    },
                    connection: conn,
                });
            }
        }
        Ok(Self {
            conn,
            transaction_id: 0,
            init,
        })
    }

    /// Language announced by the engine.
    pub fn language(&self) -> &str {
        &self.init.language
    }

    /// IDE key announced by the engine.
    pub fn idekey(&self) -> &str {
        &self.init.idekey
    }

    /// Protocol version announced by the engine.
    pub fn api_version(&self) -> Option<&str> {
        self.init.api_version.as_deref()
    }

    /// URI of the file the engine announced itself paused in.
    pub fn start_file(&self) -> Option<&str> {
        self.init.file_uri.as_deref()
    }

    /// The id assigned to the most recent command.
    pub fn last_transaction_id(&self) -> u32 {
        self.transaction_id
    }

    /// Bound the wait for each response. `None` blocks indefinitely.
    pub fn set_response_timeout(
        &mut self,
        timeout: Option<std::time::Duration>,
    ) -> Result<(), DbgpError> {
        self.conn.set_read_timeout(timeout)
    }

    /// Close the underlying connection.
    pub fn close(&mut self) {
        self.conn.close();
    }

    /// Send one command and block for its response.
    ///
    /// Allocates the next transaction id, composes
    /// `"<name> -i <id> [<args>]"` (arguments dropped entirely when empty
    /// after trimming), and parses the reply — which raises any embedded
    /// `<error>` element before the caller sees a response value.
    pub fn send_command(&mut self, command: &str, args: &str) -> Result<Response, DbgpError> {
        let command = command.trim();
        let args = args.trim();
        self.transaction_id += 1;

        let mut line = format!("{command} -i {}", self.transaction_id);
        if !args.is_empty() {
            line.push(' ');
            line.push_str(args);
        }
        debug!("command: {line}");
        self.conn.send(&line)?;
        let raw = self.conn.receive()?;
        debug!("response: {raw}");
        Response::parse(raw, command, args)
    }

    /// Ask the engine for its current status.
    pub fn status(&mut self) -> Result<StatusResponse, DbgpError> {
        self.send_command("status", "").map(StatusResponse::new)
    }

    /// Query a feature (see the DBGP feature list, e.g. `encoding`).
    pub fn feature_get(&mut self, name: &str) -> Result<FeatureResponse, DbgpError> {
        self.send_command("feature_get", &format!("-n {name}"))
            .map(FeatureResponse::new)
    }

    /// Set a feature value on the engine.
    pub fn feature_set(&mut self, name: &str, value: &str) -> Result<Response, DbgpError> {
        self.send_command("feature_set", &format!("-n {name} -v {value}"))
    }

    /// Start or resume execution; blocks until the engine reports a new
    /// status.
    pub fn run(&mut self) -> Result<StatusResponse, DbgpError> {
        self.send_command("run", "").map(StatusResponse::new)
    }

    /// Step to the next statement, entering function calls.
    pub fn step_into(&mut self) -> Result<StatusResponse, DbgpError> {
        self.send_command("step_into", "").map(StatusResponse::new)
    }

    /// Step to the next statement in the current scope.
    pub fn step_over(&mut self) -> Result<StatusResponse, DbgpError> {
        self.send_command("step_over", "").map(StatusResponse::new)
    }

    /// Step out of the current scope.
    pub fn step_out(&mut self) -> Result<StatusResponse, DbgpError> {
        self.send_command("step_out", "").map(StatusResponse::new)
    }

    /// Terminate the debugged process.
    pub fn stop(&mut self) -> Result<StatusResponse, DbgpError> {
        self.send_command("stop", "").map(StatusResponse::new)
    }

    /// Detach from the engine, leaving the debuggee running.
    pub fn detach(&mut self) -> Result<StatusResponse, DbgpError> {
        self.send_command("detach", "").map(StatusResponse::new)
    }

    /// Fetch the call stack.
    pub fn stack_get(&mut self) -> Result<Response, DbgpError> {
        self.send_command("stack_get", "")
    }

    /// List the context names available at the current stack level.
    pub fn context_names(&mut self) -> Result<Response, DbgpError> {
        self.send_command("context_names", "")
    }

    /// Fetch the variables of one context (0 is the local scope).
    pub fn context_get(&mut self, context: u32, depth: u32) -> Result<Response, DbgpError> {
        self.send_command("context_get", &format!("-c {context} -d {depth}"))
    }

    /// Fetch a single property by name.
    pub fn property_get(&mut self, name: &str) -> Result<Response, DbgpError> {
        self.send_command("property_get", &format!("-n {name}"))
    }

    /// Evaluate an expression in the current context. The expression
    /// travels base64-encoded per the protocol.
    pub fn eval(&mut self, expression: &str) -> Result<Response, DbgpError> {
        let encoded = BASE64.encode(expression);
        self.send_command("eval", &format!("-- {encoded}"))
    }

    /// Install a breakpoint; `args` is the pre-rendered argument string.
    pub fn breakpoint_set(&mut self, args: &str) -> Result<Response, DbgpError> {
        self.send_command("breakpoint_set", args)
    }

    /// Remove a breakpoint by its engine-assigned id.
    pub fn breakpoint_remove(&mut self, remote_id: &str) -> Result<Response, DbgpError> {
        self.send_command("breakpoint_remove", &format!("-d {remote_id}"))
    }

    /// Update a breakpoint (e.g. enable/disable) by its engine-assigned id.
    pub fn breakpoint_update(&mut self, remote_id: &str, args: &str) -> Result<Response, DbgpError> {
        self.send_command("breakpoint_update", &format!("-d {remote_id} {args}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Status;
    use std::net::{TcpListener, TcpStream};
    use std::thread::JoinHandle;

    /// Spawn a scripted engine: it pushes `init`, then answers each
    /// received command with the next canned response. Returns the
    /// client-side connection and a handle yielding the commands the
    /// engine saw.
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

    const INIT: &str =
        r#"<init language="python" idekey="x" api_version="1.0" fileuri="file:///a.py"/>"#;

    #[test]
    fn handshake_extracts_identity() {
        let (conn, engine) = scripted_engine(INIT, vec![]);
        let api = Api::attach(conn, None).unwrap();
        assert_eq!(api.language(), "python");
        assert_eq!(api.idekey(), "x");
        assert_eq!(api.api_version(), Some("1.0"));
        assert_eq!(api.start_file(), Some("file:///a.py"));
        engine.join().unwrap();
    }

    #[test]
    fn handshake_accepts_matching_idekey() {
        let (conn, engine) = scripted_engine(INIT, vec![]);
        assert!(Api::attach(conn, Some("x")).is_ok());
        engine.join().unwrap();
    }

    #[test]
    fn handshake_rejects_wrong_idekey_but_leaves_connection_open() {
        let (conn, engine) = scripted_engine(INIT, vec![]);
        let failure = Api::attach(conn, Some("other")).unwrap_err();
        assert!(matches!(failure.error, DbgpError::IdentityMismatch { .. }));
        assert!(failure.connection.is_connected());
        engine.join().unwrap();
    }

    #[test]
    fn handshake_rejects_announce_without_language() {
        let (conn, engine) = scripted_engine(r#"<init idekey="x"/>"#, vec![]);
        let failure = Api::attach(conn, None).unwrap_err();
        assert!(matches!(
            failure.error,
            DbgpError::MalformedResponse { .. }
        ));
        engine.join().unwrap();
    }

    #[test]
    fn status_command_round_trip() {
        let (conn, engine) = scripted_engine(
            INIT,
            vec![r#"<response status="starting" transaction_id="1"/>"#.to_string()],
        );
        let mut api = Api::attach(conn, None).unwrap();
        let status = api.status().unwrap();
        assert_eq!(status.status().unwrap(), Status::Starting);

        let seen = engine.join().unwrap();
        assert_eq!(seen, vec!["status -i 1".to_string()]);
    }

    #[test]
    fn transaction_ids_are_monotonic_without_gaps() {
        let responses = (1..=4)
            .map(|id| format!(r#"<response status="break" transaction_id="{id}"/>"#))
            .collect();
        let (conn, engine) = scripted_engine(INIT, responses);
        let mut api = Api::attach(conn, None).unwrap();

        for expected in 1..=4u32 {
            let resp = api.step_over().unwrap();
            assert_eq!(resp.response().transaction_id().unwrap(), Some(expected));
            assert_eq!(api.last_transaction_id(), expected);
        }

        let seen = engine.join().unwrap();
        assert_eq!(
            seen,
            vec![
                "step_over -i 1",
                "step_over -i 2",
                "step_over -i 3",
                "step_over -i 4"
            ]
        );
    }

    #[test]
    fn arguments_are_trimmed_and_appended() {
        let (conn, engine) = scripted_engine(
            INIT,
            vec![r#"<response transaction_id="1" supported="1">utf-8</response>"#.to_string()],
        );
        let mut api = Api::attach(conn, None).unwrap();
        let feature = api.feature_get("encoding").unwrap();
        assert!(feature.is_supported().unwrap());
        assert_eq!(feature.value().unwrap().as_deref(), Some("utf-8"));

        let seen = engine.join().unwrap();
        assert_eq!(seen, vec!["feature_get -i 1 -n encoding".to_string()]);
    }

    #[test]
    fn empty_arguments_are_omitted_entirely() {
        let (conn, engine) = scripted_engine(
            INIT,
            vec![r#"<response status="break" transaction_id="1"/>"#.to_string()],
        );
        let mut api = Api::attach(conn, None).unwrap();
        api.send_command("  run  ", "   ").unwrap();

        let seen = engine.join().unwrap();
        assert_eq!(seen, vec!["run -i 1".to_string()]);
    }

    #[test]
    fn embedded_error_raises_before_any_accessor() {
        let (conn, engine) = scripted_engine(
            INIT,
            vec![
                r#"<response transaction_id="1"><error code="205"><message>No such breakpoint</message></error></response>"#
                    .to_string(),
            ],
        );
        let mut api = Api::attach(conn, None).unwrap();
        let err = api.breakpoint_remove("9").unwrap_err();
        assert!(matches!(err, DbgpError::Protocol { code: 205, .. }));
        engine.join().unwrap();
    }

    #[test]
    fn eval_sends_base64_body() {
        let (conn, engine) = scripted_engine(
            INIT,
            vec![r#"<response transaction_id="1"/>"#.to_string()],
        );
        let mut api = Api::attach(conn, None).unwrap();
        api.eval("$x + 1").unwrap();

        let seen = engine.join().unwrap();
        let expected = format!("eval -i 1 -- {}", BASE64.encode("$x + 1"));
        assert_eq!(seen, vec![expected]);
    }

    #[test]
    fn engine_disconnect_surfaces_end_of_stream() {
        let (conn, engine) = scripted_engine(INIT, vec![]);
        let mut api = Api::attach(conn, None).unwrap();
        engine.join().unwrap();

        // Depending on timing the failure shows up on the write (reset
        // socket) or on the read (clean EOF); both are transport-fatal.
        let err = api.status().unwrap_err();
        assert!(err.is_fatal_to_session(), "got: {err}");
    }
}
