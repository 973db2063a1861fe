use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Initialization and run state of the annotation session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LifecycleState {
    Uninitialized,
    ModelsLoading,
    ModelsReady,
    CameraStarting,
    CameraReady,
    Detecting,
    Failed { reason: String },
    Stopped,
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Failed { .. } | LifecycleState::Stopped)
    }

    pub fn name(&self) -> &'static str {
        match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::ModelsLoading => "models_loading",
            LifecycleState::ModelsReady => "models_ready",
            LifecycleState::CameraStarting => "camera_starting",
            LifecycleState::CameraReady => "camera_ready",
            LifecycleState::Detecting => "detecting",
            LifecycleState::Failed { .. } => "failed",
            LifecycleState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    LoadModels,
    ModelsLoaded,
    ModelLoadFailed(String),
    StartCamera,
    CameraOpened,
    CameraFailed(String),
    FirstFrame,
    DetectionHalted(String),
    Shutdown,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("Event {event:?} is not valid in state {from}")]
    InvalidTransition {
        from: LifecycleState,
        event: LifecycleEvent,
    },
}

/// Pure transition function of the lifecycle graph.
pub fn transition(
    state: &LifecycleState,
    event: LifecycleEvent,
) -> Result<LifecycleState, LifecycleError> {
    use LifecycleEvent as E;
    use LifecycleState as S;

    let next = match (state, &event) {
        (S::Uninitialized, E::LoadModels) => S::ModelsLoading,
        (S::ModelsLoading, E::ModelsLoaded) => S::ModelsReady,
        (S::ModelsLoading, E::ModelLoadFailed(reason)) => S::Failed {
            reason: format!("model load failed: {reason}"),
        },
        (S::ModelsReady, E::StartCamera) => S::CameraStarting,
        (S::CameraStarting, E::CameraOpened) => S::CameraReady,
        (S::CameraStarting | S::CameraReady, E::CameraFailed(reason)) => S::Failed {
            reason: format!("camera failed: {reason}"),
        },
        (S::CameraReady, E::FirstFrame) => S::Detecting,
        (S::Detecting, E::DetectionHalted(reason)) => S::Failed {
            reason: format!("detection halted: {reason}"),
        },
        (current, E::Shutdown) if !current.is_terminal() => S::Stopped,
        (S::Failed { .. }, E::Shutdown) => state.clone(),
        _ => {
            return Err(LifecycleError::InvalidTransition {
                from: state.clone(),
                event: event.clone(),
            })
        }
    };

    Ok(next)
}

/// Shared holder of the current state.
#[derive(Debug)]
pub struct Lifecycle {
    state: Mutex<LifecycleState>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LifecycleState::Uninitialized),
        }
    }

    pub fn current(&self) -> LifecycleState {
        self.state.lock().clone()
    }

    pub fn apply(&self, event: LifecycleEvent) -> Result<LifecycleState, LifecycleError> {
        let mut state = self.state.lock();
        let next = transition(&state, event)?;
        if *state != next {
            match &next {
                LifecycleState::Failed { reason } => {
                    tracing::error!("Lifecycle {} -> failed: {}", state.name(), reason)
                }
                _ => tracing::info!("Lifecycle {} -> {}", state.name(), next.name()),
            }
        }
        *state = next.clone();
        Ok(next)
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleEvent as E;
    use LifecycleState as S;

    #[test]
    fn test_happy_path() {
        let mut state = S::Uninitialized;
        for (event, expected) in [
            (E::LoadModels, S::ModelsLoading),
            (E::ModelsLoaded, S::ModelsReady),
            (E::StartCamera, S::CameraStarting),
            (E::CameraOpened, S::CameraReady),
            (E::FirstFrame, S::Detecting),
            (E::Shutdown, S::Stopped),
        ] {
            state = transition(&state, event).unwrap();
            assert_eq!(state, expected);
        }
    }

    #[test]
    fn test_camera_cannot_start_before_models_ready() {
        let err = transition(&S::ModelsLoading, E::StartCamera).unwrap_err();
        assert_eq!(
            err,
            LifecycleError::InvalidTransition {
                from: S::ModelsLoading,
                event: E::StartCamera
            }
        );
        assert!(transition(&S::Uninitialized, E::StartCamera).is_err());
    }

    #[test]
    fn test_model_failure_is_terminal() {
        let failed = transition(&S::ModelsLoading, E::ModelLoadFailed("missing".into())).unwrap();
        assert_eq!(
            failed,
            S::Failed {
                reason: "model load failed: missing".into()
            }
        );
        assert!(transition(&failed, E::StartCamera).is_err());
        assert!(transition(&failed, E::FirstFrame).is_err());
        assert_eq!(transition(&failed, E::Shutdown).unwrap(), failed);
    }

    #[test]
    fn test_detection_requires_first_frame_after_camera() {
        assert!(transition(&S::CameraStarting, E::FirstFrame).is_err());
        assert!(transition(&S::ModelsReady, E::FirstFrame).is_err());
    }

    #[test]
    fn test_stopped_rejects_everything() {
        assert!(transition(&S::Stopped, E::Shutdown).is_err());
        assert!(transition(&S::Stopped, E::LoadModels).is_err());
    }

    #[test]
    fn test_lifecycle_rejects_invalid_event_without_changing_state() {
        let lifecycle = Lifecycle::new();

        lifecycle.apply(E::LoadModels).unwrap();
        assert_eq!(lifecycle.current(), S::ModelsLoading);

        assert!(lifecycle.apply(E::FirstFrame).is_err());
        assert_eq!(lifecycle.current(), S::ModelsLoading);
    }

    #[test]
    fn test_state_serializes_with_tag() {
        let failed = S::Failed {
            reason: "camera failed: denied".into(),
        };
        let json = serde_json::to_string(&failed).unwrap();
        assert_eq!(json, r#"{"state":"failed","reason":"camera failed: denied"}"#);
        assert_eq!(
            serde_json::to_string(&S::Detecting).unwrap(),
            r#"{"state":"detecting"}"#
        );
    }
}
