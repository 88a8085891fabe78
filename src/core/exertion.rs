//! The exertion tree: tasks, jobs and blocks.
//!
//! An [`Exertion`] is a unit of work. Tasks are leaves bound to a service
//! [`Signature`]; jobs and blocks are composites whose children are ordered
//! by the dependency graph before dispatch. Parent links are plain ids so
//! the tree never owns a cycle.

use crate::core::context::{ContextId, DataContext};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Unique identifier for an exertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExertionId(pub Uuid);

impl ExertionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for ExertionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExertionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ExertionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Execution state of an exertion or an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecState {
    #[default]
    Initial,
    Running,
    Done,
    Failed,
    Error,
    Suspended,
    /// Published to the work queue and awaiting pickup.
    InSpace,
    /// Abandoned after a sibling failed.
    Poisoned,
    Stopped,
}

impl ExecState {
    /// States a dispatcher can finish in.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecState::Done
                | ExecState::Failed
                | ExecState::Error
                | ExecState::Suspended
                | ExecState::Poisoned
                | ExecState::Stopped
        )
    }

    /// States at or below FAILED: anything that must fail the parent.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ExecState::Failed | ExecState::Error | ExecState::Poisoned | ExecState::Stopped
        )
    }
}

impl std::fmt::Display for ExecState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecState::Initial => "initial",
            ExecState::Running => "running",
            ExecState::Done => "done",
            ExecState::Failed => "failed",
            ExecState::Error => "error",
            ExecState::Suspended => "suspended",
            ExecState::InSpace => "in_space",
            ExecState::Poisoned => "poisoned",
            ExecState::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Flow {
    #[default]
    Seq,
    Par,
    /// Inferred from data dependencies before dispatch.
    Auto,
}

impl std::fmt::Display for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Flow::Seq => write!(f, "seq"),
            Flow::Par => write!(f, "par"),
            Flow::Auto => write!(f, "auto"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    /// Executed in-process or by a direct call to the target service.
    #[default]
    Push,
    /// Executed through the shared work queue.
    Pull,
}

/// Names the service operation a task invokes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    pub service_type: String,
    pub selector: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Signature {
    pub fn new(service_type: &str, selector: &str) -> Self {
        Self {
            service_type: service_type.to_string(),
            selector: selector.to_string(),
            provider_name: None,
            version: None,
        }
    }

    pub fn with_provider(mut self, name: &str) -> Self {
        self.provider_name = Some(name.to_string());
        self
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = Some(version.to_string());
        self
    }
}

impl std::fmt::Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.service_type, self.selector)?;
        if let Some(name) = &self.provider_name {
            write!(f, "@{}", name)?;
        }
        Ok(())
    }
}

/// Deployment descriptor for a service that can be provisioned on demand.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Deployment {
    pub service_type: String,
    pub name: String,
    #[serde(default)]
    pub version: String,
}

impl Deployment {
    pub fn new(service_type: &str, name: &str, version: &str) -> Self {
        Self {
            service_type: service_type.to_string(),
            name: name.to_string(),
            version: version.to_string(),
        }
    }
}

impl std::fmt::Display for Deployment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.service_type, self.name)?;
        if !self.version.is_empty() {
            write!(f, ":{}", self.version)?;
        }
        Ok(())
    }
}

/// An error attached to an exertion for the caller to inspect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrowableRecord {
    pub message: String,
    /// The exertion the error originated in, when it was a child.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<ExertionId>,
    pub at: DateTime<Utc>,
}

impl ThrowableRecord {
    pub fn new(message: impl Into<String>, origin: Option<ExertionId>) -> Self {
        Self {
            message: message.into(),
            origin,
            at: Utc::now(),
        }
    }
}

/// Control metadata: how an exertion is dispatched and what happened to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ControlContext {
    #[serde(default)]
    pub flow: Flow,
    #[serde(default)]
    pub access: Access,
    /// Child executed after all regular children.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<ExertionId>,
    #[serde(default)]
    pub monitorable: bool,
    #[serde(default)]
    pub provisionable: bool,
    /// Task takes the previous sibling's output context as its input.
    #[serde(default)]
    pub continuous: bool,
    #[serde(default)]
    pub trace: Vec<String>,
    #[serde(default)]
    pub exceptions: Vec<ThrowableRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ExertionKind {
    Task { signature: Signature },
    Job,
    /// Sequential group sharing a mutable scope.
    Block,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exertion {
    #[serde(default)]
    pub id: ExertionId,
    pub name: String,
    pub kind: ExertionKind,
    #[serde(default)]
    pub status: ExecState,
    #[serde(default)]
    pub control: ControlContext,
    #[serde(default)]
    pub context: DataContext,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Exertion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ExertionId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deployments: Vec<Deployment>,
}

impl Exertion {
    fn with_kind(name: &str, kind: ExertionKind) -> Self {
        Self {
            id: ExertionId::new(),
            name: name.to_string(),
            kind,
            status: ExecState::Initial,
            control: ControlContext::default(),
            context: DataContext::new(name),
            children: Vec::new(),
            parent: None,
            deployments: Vec::new(),
        }
    }

    pub fn task(name: &str, signature: Signature) -> Self {
        Self::with_kind(name, ExertionKind::Task { signature })
    }

    pub fn job(name: &str) -> Self {
        Self::with_kind(name, ExertionKind::Job)
    }

    pub fn block(name: &str) -> Self {
        Self::with_kind(name, ExertionKind::Block)
    }

    // ========== Builders ==========

    pub fn with_child(mut self, mut child: Exertion) -> Self {
        child.parent = Some(self.id);
        self.children.push(child);
        self
    }

    /// Add `child` and designate it as the master unit.
    pub fn with_master(mut self, child: Exertion) -> Self {
        self.control.master = Some(child.id);
        self.with_child(child)
    }

    pub fn with_flow(mut self, flow: Flow) -> Self {
        self.control.flow = flow;
        self
    }

    pub fn with_access(mut self, access: Access) -> Self {
        self.control.access = access;
        self
    }

    pub fn with_input(mut self, path: &str, value: impl Into<Value>) -> Self {
        self.context.put(path, value);
        self
    }

    /// Fill `path` from `from_path` of the context `from` at dispatch time.
    pub fn with_binding(mut self, path: &str, from: ContextId, from_path: &str) -> Self {
        self.context.bind(path, Some(from), from_path);
        self
    }

    pub fn shared(mut self) -> Self {
        self.context.shared = true;
        self
    }

    pub fn continuous(mut self) -> Self {
        self.control.continuous = true;
        self
    }

    pub fn monitorable(mut self) -> Self {
        self.control.monitorable = true;
        self
    }

    pub fn provisionable(mut self, deployment: Deployment) -> Self {
        self.control.provisionable = true;
        self.deployments.push(deployment);
        self
    }

    // ========== Queries ==========

    pub fn is_task(&self) -> bool {
        matches!(self.kind, ExertionKind::Task { .. })
    }

    pub fn is_job(&self) -> bool {
        matches!(self.kind, ExertionKind::Job)
    }

    pub fn is_block(&self) -> bool {
        matches!(self.kind, ExertionKind::Block)
    }

    pub fn is_composite(&self) -> bool {
        !self.is_task()
    }

    pub fn signature(&self) -> Option<&Signature> {
        match &self.kind {
            ExertionKind::Task { signature } => Some(signature),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            ExertionKind::Task { .. } => "task",
            ExertionKind::Job => "job",
            ExertionKind::Block => "block",
        }
    }

    pub fn is_master(&self, child: &Exertion) -> bool {
        self.control.master == Some(child.id)
    }

    pub fn master_child(&self) -> Option<&Exertion> {
        let master = self.control.master?;
        self.children.iter().find(|c| c.id == master)
    }

    /// Find an exertion anywhere in this tree.
    pub fn find(&self, id: &ExertionId) -> Option<&Exertion> {
        if &self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(id))
    }

    pub fn find_mut(&mut self, id: &ExertionId) -> Option<&mut Exertion> {
        if &self.id == id {
            return Some(self);
        }
        self.children.iter_mut().find_map(|c| c.find_mut(id))
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Exertion> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find_by_name(name))
    }

    /// Visit this exertion and every descendant in pre-order.
    pub fn visit<'a>(&'a self, f: &mut impl FnMut(&'a Exertion)) {
        f(self);
        for child in &self.children {
            child.visit(f);
        }
    }

    pub fn size(&self) -> usize {
        1 + self.children.iter().map(Exertion::size).sum::<usize>()
    }

    /// Point every child's parent link at its actual parent. Trees loaded
    /// from JSON carry no parent ids.
    pub fn link_parents(&mut self) {
        let id = self.id;
        for child in &mut self.children {
            child.parent = Some(id);
            child.link_parents();
        }
    }

    // ========== Lifecycle ==========

    /// Enter RUNNING and stamp the start time.
    pub fn start(&mut self) {
        self.status = ExecState::Running;
        self.control.started_at = Some(Utc::now());
    }

    pub fn complete(&mut self) {
        self.status = ExecState::Done;
        self.control.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, message: &str) {
        self.status = ExecState::Failed;
        self.control.completed_at = Some(Utc::now());
        self.report_exception(message, None);
    }

    /// Fail because of `origin`, a descendant that ended in failure.
    pub fn fail_from(&mut self, message: &str, origin: ExertionId) {
        self.status = ExecState::Failed;
        self.control.completed_at = Some(Utc::now());
        self.report_exception(message, Some(origin));
    }

    /// Mark abandoned after a sibling failure.
    pub fn poison(&mut self) {
        self.status = ExecState::Poisoned;
        self.control.completed_at = Some(Utc::now());
        self.report_exception("poisoned by sibling failure", None);
    }

    /// Most recent attached error, if any.
    pub fn last_exception(&self) -> Option<&ThrowableRecord> {
        self.control.exceptions.last()
    }

    pub fn suspend(&mut self) {
        self.status = ExecState::Suspended;
        self.control.completed_at = Some(Utc::now());
    }

    pub fn report_exception(&mut self, message: &str, origin: Option<ExertionId>) {
        self.control
            .exceptions
            .push(ThrowableRecord::new(message, origin));
    }

    pub fn trace(&mut self, note: impl Into<String>) {
        self.control.trace.push(note.into());
    }

    /// Put this exertion and all non-DONE descendants back to INITIAL.
    pub fn reset_unfinished(&mut self) {
        if self.status == ExecState::Done {
            return;
        }
        self.status = ExecState::Initial;
        self.control.completed_at = None;
        for child in &mut self.children {
            child.reset_unfinished();
        }
    }

    /// One-line description for traces and logs.
    pub fn describe(&self) -> String {
        format!("{} '{}' [{}]", self.kind_name(), self.name, self.id.short())
    }
}
