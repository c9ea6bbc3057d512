//! Breakpoint intent, held locally and replayed onto each session.
//!
//! Local ids are assigned at creation and never reused; the engine's
//! remote id for a breakpoint is only valid while a session is attached
//! and is re-assigned on the next session's replay.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::path::PathMap;

/// The DBGP breakpoint types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakpointKind {
    /// Break when a line is reached.
    Line {
        /// Local source path.
        path: String,
        /// 1-based line number.
        line: u32,
    },
    /// Break on a line when an expression evaluates true.
    Conditional {
        path: String,
        line: u32,
        expression: String,
    },
    /// Break when an exception of the given name is raised.
    Exception { name: String },
    /// Break when a function is entered.
    Call { function: String },
    /// Break when a function returns.
    Return { function: String },
    /// Break when a watched expression changes.
    Watch { expression: String },
}

impl BreakpointKind {
    /// The `-t` type token for this kind.
    pub fn type_name(&self) -> &'static str {
        match self {
            BreakpointKind::Line { .. } => "line",
            BreakpointKind::Conditional { .. } => "conditional",
            BreakpointKind::Exception { .. } => "exception",
            BreakpointKind::Call { .. } => "call",
            BreakpointKind::Return { .. } => "return",
            BreakpointKind::Watch { .. } => "watch",
        }
    }

    /// File and line, for kinds anchored to a source location.
    pub fn location(&self) -> Option<(&str, u32)> {
        match self {
            BreakpointKind::Line { path, line }
            | BreakpointKind::Conditional { path, line, .. } => Some((path, *line)),
            _ => None,
        }
    }
}

/// One locally-held breakpoint record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    id: u32,
    kind: BreakpointKind,
    enabled: bool,
    remote_id: Option<String>,
}

impl Breakpoint {
    /// Stable local id.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn kind(&self) -> &BreakpointKind {
        &self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Engine-assigned id, present only while a session holds this
    /// breakpoint installed.
    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }

    /// Render the `breakpoint_set` argument string for this record.
    ///
    /// Expressions travel base64-encoded; file paths go through the
    /// path mapper to become engine-side URIs.
    pub fn command_args(&self, paths: &dyn PathMap) -> String {
        let mut args = format!("-t {}", self.kind.type_name());
        match &self.kind {
            BreakpointKind::Line { path, line }
            | BreakpointKind::Conditional { path, line, .. } => {
                args.push_str(&format!(" -f {} -n {line}", paths.to_remote(path)));
            }
            BreakpointKind::Exception { name } => {
                args.push_str(&format!(" -x {name}"));
            }
            BreakpointKind::Call { function } | BreakpointKind::Return { function } => {
                args.push_str(&format!(" -m {function}"));
            }
            BreakpointKind::Watch { .. } => {}
        }
        if !self.enabled {
            args.push_str(" -s disabled");
        }
        match &self.kind {
            BreakpointKind::Conditional { expression, .. }
            | BreakpointKind::Watch { expression } => {
                args.push_str(&format!(" -- {}", BASE64.encode(expression)));
            }
            _ => {}
        }
        args
    }
}

/// Holds breakpoint intent independent of any live session.
#[derive(Debug, Default)]
pub struct BreakpointStore {
    next_id: u32,
    records: BTreeMap<u32, Breakpoint>,
}

impl BreakpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a breakpoint and return its local id. New breakpoints start
    /// enabled.
    pub fn add(&mut self, kind: BreakpointKind) -> u32 {
        self.next_id += 1;
        let id = self.next_id;
        self.records.insert(
            id,
            Breakpoint {
                id,
                kind,
                enabled: true,
                remote_id: None,
            },
        );
        id
    }

    pub fn get(&self, id: u32) -> Option<&Breakpoint> {
        self.records.get(&id)
    }

    /// Delete a record, returning it (with any remote id still attached
    /// so the caller can issue the remove command).
    pub fn remove(&mut self, id: u32) -> Option<Breakpoint> {
        self.records.remove(&id)
    }

    /// Set the enabled flag. Returns the new state, or `None` for an
    /// unknown id.
    pub fn set_enabled(&mut self, id: u32, enabled: bool) -> Option<bool> {
        let record = self.records.get_mut(&id)?;
        record.enabled = enabled;
        Some(record.enabled)
    }

    /// Flip the enabled flag. Returns the new state.
    pub fn toggle(&mut self, id: u32) -> Option<bool> {
        let record = self.records.get_mut(&id)?;
        record.enabled = !record.enabled;
        Some(record.enabled)
    }

    /// Record the engine-assigned id for a breakpoint.
    pub fn set_remote_id(&mut self, id: u32, remote_id: impl Into<String>) -> bool {
        match self.records.get_mut(&id) {
            Some(record) => {
                record.remote_id = Some(remote_id.into());
                true
            }
            None => false,
        }
    }

    /// Forget all engine-assigned ids. Called on session teardown; the
    /// next session's replay assigns fresh ones.
    pub fn clear_remote_ids(&mut self) {
        for record in self.records.values_mut() {
            record.remote_id = None;
        }
    }

    /// All records in stable id order.
    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.records.values()
    }

    /// Enabled records in stable id order (the replay set).
    pub fn enabled(&self) -> impl Iterator<Item = &Breakpoint> {
        self.records.values().filter(|bp| bp.enabled)
    }

    /// Ids of enabled records, for replay without holding a borrow.
    pub fn enabled_ids(&self) -> Vec<u32> {
        self.enabled().map(Breakpoint::id).collect()
    }

    /// Find the breakpoint anchored at a source location.
    pub fn find_at(&self, path: &str, line: u32) -> Option<u32> {
        self.records
            .values()
            .find(|bp| bp.kind.location() == Some((path, line)))
            .map(Breakpoint::id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
