//! Request dispatch: accept or decline execute requests, prepare and start
//! accepted ones, and forward cancellations to the engine.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::bus::messages::{
    BusMessage, CancelRequest, ErrorExecutionStatus, ExecuteRequest, RequestIgnored,
    StartExecutionStatus,
};
use crate::bus::transport::{Delivery, MessageHandler};
use crate::core::errors::{MediatorError, Result};
use crate::engine::{FailureReason, TaskListener, TaskStart};
use crate::mediator::correlator::{ExecutionRecord, ResultCorrelator};
use crate::mediator::pool::WorkerPool;
use crate::mediator::MediatorContext;
use crate::model::declaration::DeclarationKind;

pub struct RequestDispatcher {
    ctx: Arc<MediatorContext>,
    pool: Arc<WorkerPool>,
}

impl RequestDispatcher {
    pub(crate) fn new(ctx: Arc<MediatorContext>, pool: Arc<WorkerPool>) -> Self {
        Self { ctx, pool }
    }

    async fn on_execute(&self, request: ExecuteRequest) {
        if !self.ctx.config.owns_namespace(&request.action) {
            let relayed_here = request
                .parent_uid
                .as_ref()
                .is_some_and(|parent| self.ctx.records.contains_key(parent));
            if relayed_here {
                // the relay keeps waiting until a peer reports a status for it
                warn!(
                    uid = %request.uid,
                    action = %request.action,
                    "Own relayed call declined; it stays open until an owner or an IgnoredExecutionStatus answers"
                );
            } else {
                debug!(uid = %request.uid, action = %request.action, "Request declined, namespace not owned");
            }
            self.ctx
                .send_best_effort(BusMessage::RequestIgnored(RequestIgnored {
                    uid: request.uid,
                    parent_uid: request.parent_uid,
                }))
                .await;
            return;
        }

        info!(uid = %request.uid, action = %request.action, stepped = request.stepped, "Request accepted");
        let ctx = self.ctx.clone();
        let uid = request.uid.clone();
        let accepted = self.pool.spawn(async move {
            if let Err(e) = start_execution(&ctx, &request).await {
                report_failed_start(&ctx, &request, &e).await;
            }
        });
        if !accepted {
            warn!(uid = %uid, "Dispatcher is shut down, request dropped");
        }
    }

    fn on_cancel(&self, request: CancelRequest) {
        if self.ctx.engine.cancel_task(&request.uid) {
            info!(uid = %request.uid, "Cancellation forwarded to engine");
        } else if self.ctx.records.contains_key(&request.uid) {
            warn!(uid = %request.uid, "Engine refused cancellation of a running execution");
        } else {
            debug!(uid = %request.uid, "Cancel for unknown uid ignored");
        }
    }
}

/// Everything between acceptance and the engine's `start_task`
async fn start_execution(ctx: &Arc<MediatorContext>, request: &ExecuteRequest) -> Result<()> {
    ctx.ensure_initialized().await?;
    let decl = ctx.lookup_declaration(&request.action).await?;

    ctx.locking
        .with_locked(decl, |closure, release| async move {
            for entry in closure.actions() {
                if entry.kind == DeclarationKind::Action && !ctx.engine.has_task_executor(&entry.name) {
                    return Err(MediatorError::missing_executor(entry.name.clone()));
                }
            }
            for entry in closure.entries() {
                ctx.ensure_defined(entry)?;
            }

            let serial = ctx.serials.next_serial(&request.uid).await?;
            let record = ExecutionRecord::new(
                request.uid.clone(),
                request.parent_uid.clone(),
                request.action.clone(),
                Some(closure.target().clone()),
                request.in_params.clone(),
            )
            .with_serial(serial);
            let correlator = ResultCorrelator::spawn(ctx.clone(), record, Some(release));
            correlator.send_start_message();

            let parent_listener = request
                .parent_uid
                .as_ref()
                .and_then(|parent| ctx.records.get(parent).map(|r| r.value().clone()))
                .map(|parent| parent as Arc<dyn TaskListener>);
            let task = TaskStart {
                listener: correlator.clone(),
                uid: request.uid.clone(),
                action: request.action.clone(),
                args: request.in_params.clone(),
                parent_listener,
                stepped: request.stepped,
            };
            if let Err(failure) = ctx.engine.start_task(task).await {
                warn!(uid = %request.uid, error = %failure, "Engine rejected task");
                correlator.on_failure(FailureReason::Engine(failure), Vec::new());
            }
            Ok(())
        })
        .await
}

/// Synthetic start immediately followed by the error, so the requester always
/// sees a terminal status
async fn report_failed_start(ctx: &MediatorContext, request: &ExecuteRequest, error: &MediatorError) {
    warn!(
        uid = %request.uid,
        action = %request.action,
        category = error.category(),
        error = %error,
        "Execution could not be started"
    );
    let serial = match ctx.serials.next_serial(&request.uid).await {
        Ok(serial) => serial,
        Err(e) => {
            debug!(uid = %request.uid, error = %e, "No serial for synthetic start");
            0
        }
    };
    ctx.send_best_effort(BusMessage::StartExecutionStatus(StartExecutionStatus {
        uid: request.uid.clone(),
        parent_uid: request.parent_uid.clone(),
        action: request.action.clone(),
        serial,
        in_params: request.in_params.clone(),
    }))
    .await;

    let mut wire = error.to_execution_error();
    if wire.action.is_none() {
        wire = wire.with_action(request.action.clone());
    }
    ctx.send_best_effort(BusMessage::ErrorExecutionStatus(ErrorExecutionStatus {
        uid: request.uid.clone(),
        parent_uid: request.parent_uid.clone(),
        error: wire,
    }))
    .await;
}

#[async_trait]
impl MessageHandler for RequestDispatcher {
    async fn handle(&self, delivery: Delivery) {
        match delivery.message {
            BusMessage::ExecuteRequest(request) => self.on_execute(request).await,
            BusMessage::CancelRequest(request) => self.on_cancel(request),
            _ => {}
        }
    }
}
