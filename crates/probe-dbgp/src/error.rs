//! DBGP error taxonomy.

use thiserror::Error;

/// Errors from DBGP client operations.
#[derive(Debug, Error)]
pub enum DbgpError {
    /// No peer within the accept window, or no response within the read
    /// window. Ends the current session or listen attempt only.
    #[error("timed out waiting for {waiting_for}")]
    Timeout {
        /// What was being waited on (e.g. "connection", "response").
        waiting_for: String,
    },

    /// The engine closed the socket mid-read.
    #[error("connection closed by the debugger engine")]
    EndOfStream,

    /// A frame or XML payload could not be parsed, or an error element
    /// was missing its code or message.
    #[error("malformed response: {detail}")]
    MalformedResponse {
        /// What could not be parsed.
        detail: String,
        /// The offending payload (or frame prefix), for the logs.
        response: String,
    },

    /// A well-formed `<error>` response from the engine.
    #[error("debugger engine error {code}: {message}")]
    Protocol {
        /// Numeric DBGP error code.
        code: u32,
        /// Message text reported by the engine.
        message: String,
    },

    /// The engine announced an IDE key other than the expected one.
    #[error("unexpected IDE key: expected {expected}, got {actual}")]
    IdentityMismatch {
        /// The key this client was configured to accept.
        expected: String,
        /// The key the engine announced.
        actual: String,
    },

    /// An operation was attempted in a session state that does not
    /// allow it. Raised before any network traffic.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        /// The rejected operation.
        operation: String,
        /// The state the session was in.
        state: String,
    },

    /// Any other socket-level failure.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

impl DbgpError {
    /// Whether this error forces the session back to idle.
    ///
    /// Transport-level failures poison the connection; protocol errors
    /// and state-machine rejections leave it usable.
    pub fn is_fatal_to_session(&self) -> bool {
        match self {
            DbgpError::Timeout { .. }
            | DbgpError::EndOfStream
            | DbgpError::MalformedResponse { .. }
            | DbgpError::Io(_) => true,
            DbgpError::Protocol { .. }
            | DbgpError::IdentityMismatch { .. }
            | DbgpError::InvalidState { .. } => false,
        }
    }

    /// Shorthand constructor for timeout errors.
    pub(crate) fn timeout(waiting_for: impl Into<String>) -> Self {
        DbgpError::Timeout {
            waiting_for: waiting_for.into(),
        }
    }

    /// Shorthand constructor for malformed-response errors.
    pub(crate) fn malformed(detail: impl Into<String>, response: impl Into<String>) -> Self {
        DbgpError::MalformedResponse {
            detail: detail.into(),
            response: response.into(),
        }
    }
}

/// The fixed meaning of a DBGP numeric error code.
///
/// These texts are part of the protocol's compatibility surface: engines
/// and tooling key off them, so they are reproduced unchanged.
pub fn error_code_meaning(code: u32) -> Option<&'static str> {
    let meaning = match code {
        // 000 Command parsing errors
        0 => "no error",
        1 => "parse error in command",
        2 => "duplicate arguments in command",
        3 => "invalid options (ie, missing a required option)",
        4 => "Unimplemented command",
        5 => "Command not available (Is used for async commands. For instance if the engine is in state \"run\" than only \"break\" and \"status\" are available). ",
        // 100 File related errors
        100 => "can not open file (as a reply to a \"source\" command if the requested source file can't be opened)",
        101 => "stream redirect failed ",
        // 200 Breakpoint, or code flow errors
        200 => "breakpoint could not be set (for some reason the breakpoint could not be set due to problems registering it)",
        201 => "breakpoint type not supported (for example I don't support 'watch' yet and thus return this error)",
        202 => "invalid breakpoint (the IDE tried to set a breakpoint on a line that does not exist in the file (ie \"line 0\" or lines past the end of the file)",
        203 => "no code on breakpoint line (the IDE tried to set a breakpoint on a line which does not have any executable code. The debugger engine is NOT required to return this type if it is impossible to determine if there is code on a given location. (For example, in the PHP debugger backend this will only be returned in some special cases where the current scope falls into the scope of the breakpoint to be set)).",
        204 => "Invalid breakpoint state (using an unsupported breakpoint state was attempted)",
        205 => "No such breakpoint (used in breakpoint_get etc. to show that there is no breakpoint with the given ID)",
        206 => "Error evaluating code (use from eval() (or perhaps property_get for a full name get))",
        207 => "Invalid expression (the expression used for a non-eval() was invalid) ",
        // 300 Data errors
        300 => "Can not get property (when the requested property to get did not exist, this is NOT used for an existing but uninitialized property, which just gets the type \"uninitialised\" (See: PreferredTypeNames)).",
        301 => "Stack depth invalid (the -d stack depth parameter did not exist (ie, there were less stack elements than the number requested) or the parameter was < 0)",
        302 => "Context invalid (an non existing context was requested) ",
        // 900 Protocol errors
        900 => "Encoding not supported",
        998 => "An internal exception in the debugger occurred",
        999 => "Unknown error ",
        _ => return None,
    };
    Some(meaning)
}
