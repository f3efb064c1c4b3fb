use serde::Serialize;
use tokio::sync::mpsc;

/// Emitted once per entity as a stage completes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub stage: &'static str,
    /// 1-based position of the entity within the stage.
    pub entity_index: usize,
    pub total: usize,
    pub message: String,
}

pub type ProgressSender = mpsc::UnboundedSender<ProgressEvent>;
pub type ProgressReceiver = mpsc::UnboundedReceiver<ProgressEvent>;

pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Send an event if anyone is listening; a closed receiver is not an error.
pub fn emit(progress: Option<&ProgressSender>, event: ProgressEvent) {
    match progress {
        Some(tx) => {
            let _ = tx.send(event);
        }
        None => tracing::debug!(
            stage = event.stage,
            entity_index = event.entity_index,
            total = event.total,
            "{}",
            event.message
        ),
    }
}
