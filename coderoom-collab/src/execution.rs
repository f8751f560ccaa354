//! Single-flight code execution per room.
//!
//! ```text
//! Idle ──run_request──► Running ──executor result──► Idle  (RunCompleted)
//!                          │    ──executor error───► Idle  (RunFailed)
//!                          └────timeout────────────► Idle  (RunFailed: timeout)
//! ```
//!
//! The executor is awaited with no room lock held. Its result re-enters the
//! room through [`ExecutionDispatcher::finish`], which only acts if the room
//! is still running that exact request, so whichever of timeout and result
//! arrives first wins and the other is dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::broadcast::Audience;
use crate::error::RoomError;
use crate::protocol::{
    ConnectionId, Language, RequestId, RoomId, RunFailure, RunOutcome, RunRecord, ServerMessage,
};
use crate::room::ExecutionState;
use crate::sandbox::{ExecutionOutput, ExecutorError, SandboxExecutor};
use crate::session::SessionStore;

/// Appended to output that was cut short.
pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Upper bound on one executor call.
    pub timeout: Duration,
    /// Bytes of stdout and of stderr forwarded to clients.
    pub max_output_bytes: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_output_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    Pending,
    Dispatched,
    Completed { output: ExecutionOutput, success: bool },
    Failed { reason: RunFailure },
    TimedOut,
}

/// One run, from acceptance until its result is broadcast.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub request_id: RequestId,
    pub room_id: RoomId,
    /// Buffer as it was when the run was accepted.
    pub code: String,
    pub language: Language,
    pub requested_by: ConnectionId,
    pub status: ExecutionStatus,
}

impl ExecutionRequest {
    fn outcome(&self, max_output_bytes: usize) -> Option<RunOutcome> {
        let outcome = match &self.status {
            ExecutionStatus::Pending | ExecutionStatus::Dispatched => return None,
            ExecutionStatus::Completed { output, success } => RunOutcome::Completed {
                stdout: truncate_output(&output.stdout, max_output_bytes),
                stderr: truncate_output(&output.stderr, max_output_bytes),
                exit_code: output.exit_code,
                success: *success,
            },
            ExecutionStatus::Failed { reason } => RunOutcome::Failed {
                reason: reason.clone(),
            },
            ExecutionStatus::TimedOut => RunOutcome::Failed {
                reason: RunFailure::ExecutionTimeout,
            },
        };
        Some(outcome)
    }
}

#[derive(Clone)]
pub struct ExecutionDispatcher {
    store: SessionStore,
    executor: Arc<dyn SandboxExecutor>,
    config: Arc<ExecutionConfig>,
}

impl ExecutionDispatcher {
    pub fn new(store: SessionStore, executor: Arc<dyn SandboxExecutor>, config: ExecutionConfig) -> Self {
        Self {
            store,
            executor,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Accept a run and dispatch it in the background.
    ///
    /// The requester gets `RunAccepted`, then the whole room gets
    /// `RunStarted`, followed later by exactly one `RunCompleted` or
    /// `RunFailed`.
    pub async fn run_request(
        &self,
        room_id: &RoomId,
        requested_by: ConnectionId,
    ) -> Result<RequestId, RoomError> {
        let request = self
            .store
            .mutate(room_id, |room| {
                if !room.is_member(requested_by) {
                    return Err(RoomError::NotInRoom(room.id.clone()));
                }
                if !room.settings.allow_execution {
                    return Err(RoomError::ExecutionDisabled(room.id.clone()));
                }
                if let ExecutionState::Running { request_id, .. } = room.execution {
                    return Err(RoomError::AlreadyRunning(request_id));
                }

                let mut request = ExecutionRequest {
                    request_id: RequestId::new(),
                    room_id: room.id.clone(),
                    code: room.buffer.clone(),
                    language: room.language,
                    requested_by,
                    status: ExecutionStatus::Pending,
                };
                room.execution = ExecutionState::Running {
                    request_id: request.request_id,
                    requested_by,
                    started_at: Instant::now(),
                };
                room.publish(
                    Audience::Only(requested_by),
                    ServerMessage::RunAccepted {
                        request_id: request.request_id,
                    },
                );
                room.publish(
                    Audience::All,
                    ServerMessage::RunStarted {
                        request_id: request.request_id,
                        requested_by,
                        language: request.language,
                    },
                );
                request.status = ExecutionStatus::Dispatched;
                log::info!(
                    "Run {} accepted in {} ({}, {} bytes)",
                    request.request_id,
                    room.id,
                    request.language,
                    request.code.len()
                );
                Ok(request)
            })
            .await?;

        let request_id = request.request_id;
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.drive(request).await });
        Ok(request_id)
    }

    async fn drive(&self, mut request: ExecutionRequest) {
        let executor = self.executor.clone();
        let code = request.code.clone();
        let language = request.language;
        let mut call = tokio::spawn(async move { executor.execute(&code, language).await });

        request.status = match tokio::time::timeout(self.config.timeout, &mut call).await {
            Ok(Ok(Ok(output))) => ExecutionStatus::Completed {
                success: output.success(),
                output,
            },
            Ok(Ok(Err(ExecutorError::UnsupportedLanguage(language)))) => ExecutionStatus::Failed {
                reason: RunFailure::UnsupportedLanguage { language },
            },
            Ok(Ok(Err(e))) => {
                log::error!("Run {} failed in executor: {e}", request.request_id);
                ExecutionStatus::Failed {
                    reason: RunFailure::ExecutorUnavailable {
                        detail: e.to_string(),
                    },
                }
            }
            Ok(Err(e)) => {
                log::error!("Run {} executor task died: {e}", request.request_id);
                ExecutionStatus::Failed {
                    reason: RunFailure::ExecutorUnavailable {
                        detail: "executor task failed".into(),
                    },
                }
            }
            Err(_) => {
                call.abort();
                log::warn!(
                    "Run {} timed out after {:?}",
                    request.request_id,
                    self.config.timeout
                );
                ExecutionStatus::TimedOut
            }
        };

        if let Some(outcome) = request.outcome(self.config.max_output_bytes) {
            self.finish(&request.room_id, request.request_id, outcome).await;
        }
    }

    /// Record a terminal outcome and broadcast it. Returns `false` when the
    /// room is no longer running `request_id` (already finished, or gone).
    pub async fn finish(&self, room_id: &RoomId, request_id: RequestId, outcome: RunOutcome) -> bool {
        let result = self
            .store
            .mutate(room_id, |room| {
                let requested_by = match room.execution {
                    ExecutionState::Running {
                        request_id: current,
                        requested_by,
                        ..
                    } if current == request_id => requested_by,
                    _ => {
                        log::debug!("Discarding late result for run {request_id}");
                        return Ok(false);
                    }
                };

                room.execution = ExecutionState::Idle;
                let message = match &outcome {
                    RunOutcome::Completed {
                        stdout,
                        stderr,
                        exit_code,
                        success,
                    } => ServerMessage::RunCompleted {
                        request_id,
                        stdout: stdout.clone(),
                        stderr: stderr.clone(),
                        exit_code: *exit_code,
                        success: *success,
                    },
                    RunOutcome::Failed { reason } => ServerMessage::RunFailed {
                        request_id,
                        reason: reason.clone(),
                    },
                };
                room.last_run = Some(RunRecord {
                    request_id,
                    requested_by,
                    language: room.language,
                    outcome,
                });
                room.publish(Audience::All, message);
                log::info!("Run {request_id} finished in {}", room.id);
                Ok(true)
            })
            .await;
        result.unwrap_or(false)
    }
}

impl std::fmt::Debug for ExecutionDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionDispatcher")
            .field("config", &self.config)
            .finish()
    }
}

/// Cap `text` at `max_bytes` on a character boundary, marking the cut.
pub fn truncate_output(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_owned();
    }
    let mut cut = max_bytes;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = String::with_capacity(cut + TRUNCATION_MARKER.len());
    out.push_str(&text[..cut]);
    out.push_str(TRUNCATION_MARKER);
    out
}
