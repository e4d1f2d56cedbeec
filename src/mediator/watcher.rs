//! Watching executions run by other parties, and relaying engine calls to them.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::bus::messages::{BusMessage, ExecuteRequest};
use crate::bus::transport::{Delivery, MessageHandler};
use crate::core::errors::{ExecutionError, MediatorError, Result};
use crate::engine::{FailureReason, SubTaskRequest, TaskExecutor, TaskListener};
use crate::mediator::pool::WorkerPool;
use crate::mediator::MediatorContext;
use crate::model::declaration::Declaration;
use crate::model::names::{ActionName, TransactionUid};

/// Interest in the outcome of a remote execution
pub struct PendingWatch {
    pub action: ActionName,
    pub listener: Arc<dyn TaskListener>,
    pub declaration: Option<Arc<Declaration>>,
    /// Arguments as sent; outputs are overlaid on a copy
    pub template: Vec<Value>,
    pub registered_at: DateTime<Utc>,
}

impl PendingWatch {
    /// Declared output positions from `out_params` laid over the template
    fn overlay(&self, out_params: &[Value]) -> Vec<Value> {
        let Some(decl) = &self.declaration else {
            return out_params.to_vec();
        };
        let mut completed = self.template.clone();
        completed.resize(decl.arity().max(completed.len()), Value::Null);
        for pos in decl.output_positions() {
            completed[pos] = out_params.get(pos).cloned().unwrap_or(Value::Null);
        }
        completed
    }
}

/// Demultiplexes status messages to the listeners waiting on them
#[derive(Default)]
pub struct ExecutionStatusWatcher {
    watches: DashMap<TransactionUid, PendingWatch>,
}

impl ExecutionStatusWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watch(
        &self,
        uid: TransactionUid,
        action: ActionName,
        listener: Arc<dyn TaskListener>,
        declaration: Option<Arc<Declaration>>,
        template: Vec<Value>,
    ) {
        debug!(uid = %uid, action = %action, "Watching remote execution");
        self.watches.insert(
            uid,
            PendingWatch {
                action,
                listener,
                declaration,
                template,
                registered_at: Utc::now(),
            },
        );
    }

    pub fn unwatch(&self, uid: &TransactionUid) -> bool {
        self.watches.remove(uid).is_some()
    }

    pub fn is_watching(&self, uid: &TransactionUid) -> bool {
        self.watches.contains_key(uid)
    }

    pub fn pending(&self) -> usize {
        self.watches.len()
    }

    fn take(&self, uid: &TransactionUid) -> Option<PendingWatch> {
        let watch = self.watches.remove(uid).map(|(_, w)| w);
        if watch.is_none() {
            trace!(uid = %uid, "Status for unwatched uid dropped");
        }
        watch
    }
}

#[async_trait]
impl MessageHandler for ExecutionStatusWatcher {
    async fn handle(&self, delivery: Delivery) {
        match delivery.message {
            BusMessage::StartExecutionStatus(status) => {
                if self.is_watching(&status.uid) {
                    debug!(uid = %status.uid, serial = status.serial, "Remote execution started");
                }
            }
            BusMessage::SuccessExecutionStatus(status) => {
                let Some(watch) = self.take(&status.uid) else {
                    return;
                };
                let completed = watch.overlay(&status.out_params);
                debug!(uid = %status.uid, action = %watch.action, "Remote execution succeeded");
                watch
                    .listener
                    .on_success(completed.into_iter().map(Some).collect());
            }
            BusMessage::ErrorExecutionStatus(status) => {
                let Some(watch) = self.take(&status.uid) else {
                    return;
                };
                debug!(uid = %status.uid, kind = %status.error.kind, "Remote execution failed");
                watch
                    .listener
                    .on_failure(FailureReason::Error(status.error), Vec::new());
            }
            BusMessage::IgnoredExecutionStatus(status) => {
                let Some(watch) = self.take(&status.uid) else {
                    return;
                };
                warn!(uid = %status.uid, action = %watch.action, "No executor claimed remote execution");
                watch.listener.on_failure(
                    FailureReason::Error(ExecutionError::no_executor(&watch.action)),
                    Vec::new(),
                );
            }
            _ => {}
        }
    }
}

/// Task executor that forwards engine calls to whichever mediator claims them
pub struct RemoteTaskRelay {
    ctx: Arc<MediatorContext>,
    watcher: Arc<ExecutionStatusWatcher>,
    pool: Arc<WorkerPool>,
}

impl RemoteTaskRelay {
    pub(crate) fn new(
        ctx: Arc<MediatorContext>,
        watcher: Arc<ExecutionStatusWatcher>,
        pool: Arc<WorkerPool>,
    ) -> Self {
        Self { ctx, watcher, pool }
    }
}

impl TaskExecutor for RemoteTaskRelay {
    fn execute(&self, request: SubTaskRequest) -> Result<()> {
        // the remote run is its own transaction, a child of the local sub-task
        let remote_uid = TransactionUid::generate();
        let declaration = self.ctx.model.get_inherited(&request.action);
        self.watcher.watch(
            remote_uid.clone(),
            request.action.clone(),
            request.listener.clone(),
            declaration,
            request.args.clone(),
        );

        let message = BusMessage::ExecuteRequest(ExecuteRequest {
            uid: remote_uid.clone(),
            parent_uid: Some(request.uid.clone()),
            action: request.action.clone(),
            in_params: request.args,
            stepped: request.stepped,
        });
        let ctx = self.ctx.clone();
        let accepted = self.pool.spawn(async move {
            ctx.send_best_effort(message).await;
        });
        if !accepted {
            self.watcher.unwatch(&remote_uid);
            return Err(MediatorError::internal("relay pool is shut down")
                .with_context("action", request.action.to_string()));
        }
        debug!(
            uid = %request.uid,
            remote_uid = %remote_uid,
            action = %request.action,
            "Relayed sub-task"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::messages::{
        ErrorExecutionStatus, IgnoredExecutionStatus, SuccessExecutionStatus,
    };
    use crate::core::errors::ErrorKind;
    use crate::engine::EngineFrame;
    use crate::model::declaration::Parameter;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        successes: Mutex<Vec<Vec<Option<Value>>>>,
        failures: Mutex<Vec<FailureReason>>,
    }

    impl TaskListener for Recorder {
        fn on_success(&self, results: Vec<Option<Value>>) -> bool {
            self.successes.lock().unwrap().push(results);
            true
        }

        fn on_failure(&self, reason: FailureReason, _frames: Vec<EngineFrame>) -> bool {
            self.failures.lock().unwrap().push(reason);
            false
        }

        fn create_sub_task_listener(
            &self,
            _uid: TransactionUid,
            _action: ActionName,
            _args: Vec<Value>,
        ) -> Arc<dyn TaskListener> {
            Arc::new(Recorder::default())
        }
    }

    fn measure() -> Arc<Declaration> {
        Arc::new(
            Declaration::action(ActionName::new("lab", "Measure"))
                .with_param(Parameter::input("probe", "string"))
                .with_param(Parameter::output("reading", "float")),
        )
    }

    #[tokio::test]
    async fn test_success_overlays_outputs() {
        let watcher = ExecutionStatusWatcher::new();
        let recorder = Arc::new(Recorder::default());
        let uid = TransactionUid::from("tx_remote");
        watcher.watch(
            uid.clone(),
            ActionName::new("lab", "Measure"),
            recorder.clone(),
            Some(measure()),
            vec![json!("p1"), Value::Null],
        );

        watcher
            .handle(Delivery::new(BusMessage::SuccessExecutionStatus(
                SuccessExecutionStatus {
                    uid: uid.clone(),
                    parent_uid: None,
                    in_params: vec![json!("p1"), Value::Null],
                    out_params: vec![json!("tampered"), json!(4.2)],
                },
            )))
            .await;

        assert_eq!(
            recorder.successes.lock().unwrap().clone(),
            vec![vec![Some(json!("p1")), Some(json!(4.2))]]
        );
        assert!(!watcher.is_watching(&uid));
    }

    #[tokio::test]
    async fn test_ignored_becomes_no_executor() {
        let watcher = ExecutionStatusWatcher::new();
        let recorder = Arc::new(Recorder::default());
        let uid = TransactionUid::from("tx_lonely");
        watcher.watch(
            uid.clone(),
            ActionName::new("lab", "Measure"),
            recorder.clone(),
            None,
            Vec::new(),
        );
        watcher
            .handle(Delivery::new(BusMessage::IgnoredExecutionStatus(
                IgnoredExecutionStatus { uid: uid.clone() },
            )))
            .await;

        let failures = recorder.failures.lock().unwrap();
        match failures.as_slice() {
            [FailureReason::Error(e)] => assert_eq!(e.kind, ErrorKind::Ignored),
            other => panic!("unexpected failures: {other:?}"),
        }
        assert_eq!(watcher.pending(), 0);
    }

    #[tokio::test]
    async fn test_unknown_uid_is_dropped() {
        let watcher = ExecutionStatusWatcher::new();
        let recorder = Arc::new(Recorder::default());
        watcher.watch(
            TransactionUid::from("tx_mine"),
            ActionName::new("lab", "Measure"),
            recorder.clone(),
            None,
            Vec::new(),
        );
        watcher
            .handle(Delivery::new(BusMessage::ErrorExecutionStatus(
                ErrorExecutionStatus {
                    uid: TransactionUid::from("tx_other"),
                    parent_uid: None,
                    error: ExecutionError::new(ErrorKind::Engine, "not ours"),
                },
            )))
            .await;
        assert!(recorder.failures.lock().unwrap().is_empty());
        assert_eq!(watcher.pending(), 1);
    }
}
