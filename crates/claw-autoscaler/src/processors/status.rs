//! Status processors.

use std::fmt;
use std::sync::Arc;

use crate::events::{
    Event, EventObject, EventRecorder, REASON_NOT_TRIGGER_SCALE_UP, REASON_TRIGGERED_SCALE_UP,
};
use crate::status::{ScaleUpResult, ScaleUpStatus};

/// Consumes the result of the scale-up stage.
pub trait ScaleUpStatusProcessor: Send + Sync + fmt::Debug {
    /// Handles one iteration's result.
    fn process(&self, status: &ScaleUpStatus);
}

/// Attaches scale-up outcome events to pending pods.
#[derive(Debug, Clone)]
pub struct EventingScaleUpStatusProcessor {
    recorder: Arc<dyn EventRecorder>,
}

impl EventingScaleUpStatusProcessor {
    /// Creates the processor.
    #[must_use]
    pub fn new(recorder: Arc<dyn EventRecorder>) -> Self {
        Self { recorder }
    }
}

impl ScaleUpStatusProcessor for EventingScaleUpStatusProcessor {
    fn process(&self, status: &ScaleUpStatus) {
        if status.result == ScaleUpResult::NotTried {
            return;
        }
        if status.scaled_up() {
            let groups: Vec<String> = status.scale_up_infos.iter().map(ToString::to_string).collect();
            let message = format!("pod triggered scale-up: [{}]", groups.join(" "));
            for pod in &status.pods_triggered_scale_up {
                self.recorder.record(Event::normal(
                    EventObject::Pod(pod.key()),
                    REASON_TRIGGERED_SCALE_UP,
                    message.clone(),
                ));
            }
        }
        for info in &status.pods_remain_unschedulable {
            self.recorder.record(Event::normal(
                EventObject::Pod(info.pod.key()),
                REASON_NOT_TRIGGER_SCALE_UP,
                info.message(),
            ));
        }
    }
}
