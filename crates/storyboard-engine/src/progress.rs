use std::sync::Mutex;

use storyboard_contracts::events::ProgressLog;
use tracing::warn;

/// Orchestrator states. Every invocation starts at `Idle` and ends in
/// `Succeeded` or `Failed`; nothing carries over between invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    AssemblingContext,
    Analyzing,
    Synthesizing,
    Succeeded,
    Failed,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AssemblingContext => "assembling_context",
            Self::Analyzing => "analyzing",
            Self::Synthesizing => "synthesizing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Idle, AssemblingContext)
                | (AssemblingContext, Analyzing)
                | (AssemblingContext, Failed)
                | (Analyzing, Synthesizing)
                | (Analyzing, Failed)
                | (Synthesizing, Succeeded)
                | (Synthesizing, Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStage {
    State(PipelineState),
    DossierUpserted,
}

impl ProgressStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::State(state) => state.as_str(),
            Self::DossierUpserted => "dossier_upserted",
        }
    }
}

/// Display-only notification; nothing depends on receiving it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub invocation_id: String,
    pub stage: ProgressStage,
    pub message: String,
}

/// Receives progress events on the invoking thread.
pub trait ProgressSink {
    fn notify(&self, event: &ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressEvent),
{
    fn notify(&self, event: &ProgressEvent) {
        self(event)
    }
}

pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn notify(&self, _event: &ProgressEvent) {}
}

impl ProgressSink for ProgressLog {
    fn notify(&self, event: &ProgressEvent) {
        if let Err(err) = self.append(&event.invocation_id, event.stage.as_str(), &event.message)
        {
            warn!(error = %err, path = %self.path().display(), "failed to append progress event");
        }
    }
}

/// Forwards each event to every inner sink in order.
pub struct ProgressFanout<'a> {
    sinks: Vec<&'a dyn ProgressSink>,
}

impl<'a> ProgressFanout<'a> {
    pub fn new(sinks: Vec<&'a dyn ProgressSink>) -> Self {
        Self { sinks }
    }
}

impl ProgressSink for ProgressFanout<'_> {
    fn notify(&self, event: &ProgressEvent) {
        for sink in &self.sinks {
            sink.notify(event);
        }
    }
}

#[derive(Debug, Default)]
pub struct CollectingProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl CollectingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn stages(&self) -> Vec<&'static str> {
        self.events()
            .iter()
            .map(|event| event.stage.as_str())
            .collect()
    }
}

impl ProgressSink for CollectingProgress {
    fn notify(&self, event: &ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    fn event(stage: ProgressStage) -> ProgressEvent {
        ProgressEvent {
            invocation_id: "inv-1".to_string(),
            stage,
            message: "Analyzing the scene...".to_string(),
        }
    }

    #[test]
    fn only_forward_transitions_are_legal() {
        use PipelineState::*;
        assert!(Idle.can_transition_to(AssemblingContext));
        assert!(Analyzing.can_transition_to(Failed));
        assert!(!Idle.can_transition_to(Synthesizing));
        assert!(!Analyzing.can_transition_to(Succeeded));
        assert!(!Succeeded.can_transition_to(Analyzing));
        assert!(!Failed.can_transition_to(Idle));
        assert!(Failed.is_terminal() && Succeeded.is_terminal());
    }

    #[test]
    fn closures_and_fanout_receive_events() {
        let seen = RefCell::new(Vec::new());
        let closure = |event: &ProgressEvent| seen.borrow_mut().push(event.stage.as_str());
        let collector = CollectingProgress::new();
        let sinks: Vec<&dyn ProgressSink> = vec![&closure, &collector];
        let fanout = ProgressFanout::new(sinks);

        fanout.notify(&event(ProgressStage::State(PipelineState::Analyzing)));
        fanout.notify(&event(ProgressStage::DossierUpserted));

        assert_eq!(*seen.borrow(), vec!["analyzing", "dossier_upserted"]);
        assert_eq!(collector.stages(), vec!["analyzing", "dossier_upserted"]);
    }

    #[test]
    fn progress_log_sink_records_stage_and_invocation() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("progress.jsonl");
        let log = ProgressLog::new(&path, "story-1");
        log.notify(&event(ProgressStage::State(PipelineState::Synthesizing)));
        log.notify(&event(ProgressStage::DossierUpserted));

        let records = ProgressLog::read(&path)?;
        let stages: Vec<&str> = records.iter().map(|record| record.stage.as_str()).collect();
        assert_eq!(stages, vec!["synthesizing", "dossier_upserted"]);
        assert!(records.iter().all(|record| record.invocation_id == "inv-1"));
        assert_eq!(records[0].story_id, "story-1");
        assert_eq!(records[0].message, "Analyzing the scene...");
        Ok(())
    }
}
