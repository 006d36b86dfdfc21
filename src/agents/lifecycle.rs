use serde::{Deserialize, Serialize};
use statig::prelude::*;
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    #[default]
    Initializing,
    Idle,
    Busy,
    Waiting,
    Error,
    Stopping,
    Stopped,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Initializing => "INITIALIZING",
            AgentStatus::Idle => "IDLE",
            AgentStatus::Busy => "BUSY",
            AgentStatus::Waiting => "WAITING",
            AgentStatus::Error => "ERROR",
            AgentStatus::Stopping => "STOPPING",
            AgentStatus::Stopped => "STOPPED",
        }
    }

    /// A worker in this state is not serving tasks and will not recover by itself
    pub fn is_down(self) -> bool {
        matches!(self, AgentStatus::Error | AgentStatus::Stopped)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Start,
    BeginTask { task_id: String },
    FinishTask,
    Wait,
    Resume,
    Fault { reason: String },
    Stop,
    Halted,
}

/// Worker lifecycle:
/// INITIALIZING -> IDLE <-> BUSY -> (IDLE | ERROR) -> STOPPING -> STOPPED,
/// with IDLE <-> WAITING. Events that do not apply in a state are ignored.
#[derive(Debug, Default)]
pub struct WorkerLifecycle {
    pub agent_id: String,
    status: AgentStatus,
    current_task: Option<String>,
    last_error: Option<String>,
}

impl WorkerLifecycle {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            ..Default::default()
        }
    }

    pub fn status(&self) -> AgentStatus {
        self.status
    }

    pub fn current_task(&self) -> Option<&str> {
        self.current_task.as_deref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn enter(&mut self, status: AgentStatus) {
        tracing::debug!(
            agent_id = %self.agent_id,
            from = %self.status,
            to = %status,
            "Worker status changed"
        );
        self.status = status;
    }

    fn fault(&mut self, reason: &str) -> Outcome<State> {
        tracing::warn!(agent_id = %self.agent_id, reason = %reason, "Worker entered ERROR");
        self.last_error = Some(reason.to_string());
        self.current_task = None;
        self.enter(AgentStatus::Error);
        Transition(State::error())
    }

    fn begin_stop(&mut self) -> Outcome<State> {
        self.current_task = None;
        self.enter(AgentStatus::Stopping);
        Transition(State::stopping())
    }
}

#[state_machine(initial = "State::initializing()")]
impl WorkerLifecycle {
    #[state]
    fn initializing(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Start => {
                self.enter(AgentStatus::Idle);
                Transition(State::idle())
            }
            LifecycleEvent::Fault { reason } => self.fault(reason),
            LifecycleEvent::Stop => self.begin_stop(),
            _ => Handled,
        }
    }

    #[state]
    fn idle(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::BeginTask { task_id } => {
                self.current_task = Some(task_id.clone());
                self.enter(AgentStatus::Busy);
                Transition(State::busy())
            }
            LifecycleEvent::Wait => {
                self.enter(AgentStatus::Waiting);
                Transition(State::waiting())
            }
            LifecycleEvent::Fault { reason } => self.fault(reason),
            LifecycleEvent::Stop => self.begin_stop(),
            _ => Handled,
        }
    }

    #[state]
    fn busy(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::FinishTask => {
                self.current_task = None;
                self.enter(AgentStatus::Idle);
                Transition(State::idle())
            }
            LifecycleEvent::Fault { reason } => self.fault(reason),
            LifecycleEvent::Stop => self.begin_stop(),
            _ => Handled,
        }
    }

    #[state]
    fn waiting(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Resume => {
                self.enter(AgentStatus::Idle);
                Transition(State::idle())
            }
            LifecycleEvent::BeginTask { task_id } => {
                self.current_task = Some(task_id.clone());
                self.enter(AgentStatus::Busy);
                Transition(State::busy())
            }
            LifecycleEvent::Fault { reason } => self.fault(reason),
            LifecycleEvent::Stop => self.begin_stop(),
            _ => Handled,
        }
    }

    // Only a restart brings a worker back from ERROR
    #[state]
    fn error(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Stop => self.begin_stop(),
            _ => Handled,
        }
    }

    #[state]
    fn stopping(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Halted => {
                self.enter(AgentStatus::Stopped);
                Transition(State::stopped())
            }
            _ => Handled,
        }
    }

    #[state]
    fn stopped(&mut self) -> Outcome<State> {
        Handled
    }
}
