//! Result correlation: turns engine completion callbacks for one transaction
//! into ordered status messages on the bus.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::bus::messages::{
    BusMessage, ErrorExecutionStatus, StartExecutionStatus, SuccessExecutionStatus,
};
use crate::core::errors::{ExecutionError, MediatorError, StackFrame};
use crate::engine::{EngineFrame, FailureReason, TaskListener};
use crate::mediator::locking::LockRelease;
use crate::mediator::MediatorContext;
use crate::model::declaration::Declaration;
use crate::model::names::{ActionName, TransactionUid};

/// Per-transaction state kept while an execution is in flight
#[derive(Clone, Debug)]
pub struct ExecutionRecord {
    pub uid: TransactionUid,
    pub parent_uid: Option<TransactionUid>,
    pub action: ActionName,
    /// None when the action has no declared signature (a gesture)
    pub declaration: Option<Arc<Declaration>>,
    /// Requested from the serial authority when absent
    pub serial: Option<u64>,
    pub in_params: Vec<Value>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn new(
        uid: TransactionUid,
        parent_uid: Option<TransactionUid>,
        action: ActionName,
        declaration: Option<Arc<Declaration>>,
        in_params: Vec<Value>,
    ) -> Self {
        Self {
            uid,
            parent_uid,
            action,
            declaration,
            serial: None,
            in_params,
            created_at: Utc::now(),
        }
    }

    pub fn with_serial(mut self, serial: u64) -> Self {
        self.serial = Some(serial);
        self
    }

    fn start(&self) -> Outbound {
        Outbound::Start {
            uid: self.uid.clone(),
            parent_uid: self.parent_uid.clone(),
            action: self.action.clone(),
            serial: self.serial,
            in_params: self.in_params.clone(),
        }
    }
}

/// Work item on a correlator's send queue
enum Outbound {
    Start {
        uid: TransactionUid,
        parent_uid: Option<TransactionUid>,
        action: ActionName,
        serial: Option<u64>,
        in_params: Vec<Value>,
    },
    Status(BusMessage),
    /// Terminal status has been queued; release locks and deregister
    Cleanup,
}

/// Success of a gesture is reported as a bracketing pair
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GesturePhase {
    Start,
    End,
}

/// Output values from `results` at output positions, `in_params` everywhere else
pub fn map_outputs(decl: &Declaration, in_params: &[Value], results: &[Option<Value>]) -> Vec<Value> {
    let mut out: Vec<Value> = (0..decl.arity())
        .map(|i| in_params.get(i).cloned().unwrap_or(Value::Null))
        .collect();
    for pos in decl.output_positions() {
        out[pos] = results.get(pos).cloned().flatten().unwrap_or(Value::Null);
    }
    out
}

/// Fold whatever the engine reported into one wire error
pub fn normalize_failure(
    action: &ActionName,
    reason: FailureReason,
    frames: &[EngineFrame],
    resolve_symbol: impl Fn(&str) -> Option<ActionName>,
) -> ExecutionError {
    let error = match reason {
        FailureReason::Error(error) => error,
        FailureReason::Engine(failure) if failure.is_aborted() => {
            MediatorError::cancelled(action.clone()).to_execution_error()
        }
        FailureReason::Engine(failure) => MediatorError::from(failure).to_execution_error(),
        FailureReason::Other(text) => MediatorError::engine(None, text).to_execution_error(),
        FailureReason::Missing => {
            MediatorError::unknown("engine reported no failure reason").to_execution_error()
        }
    };

    let stack: Vec<StackFrame> = frames
        .iter()
        .filter_map(|frame| match resolve_symbol(&frame.symbol) {
            Some(action) => Some(StackFrame {
                action,
                offset: frame.offset,
            }),
            None => {
                trace!(symbol = %frame.symbol, "Dropping frame with no action name");
                None
            }
        })
        .collect();

    let error = if error.stack.is_empty() && !stack.is_empty() {
        error.with_stack(stack)
    } else {
        error
    };
    if error.action.is_none() {
        error.with_action(action.clone())
    } else {
        error
    }
}

/// Engine-facing listener for one execution record
pub struct ResultCorrelator {
    ctx: Arc<MediatorContext>,
    record: ExecutionRecord,
    outbox: mpsc::UnboundedSender<Outbound>,
    finished: AtomicBool,
}

impl ResultCorrelator {
    /// Create the correlator, register it under its uid and start its send
    /// queue. `release` is held until the terminal status has been sent.
    pub(crate) fn spawn(
        ctx: Arc<MediatorContext>,
        record: ExecutionRecord,
        release: Option<LockRelease>,
    ) -> Arc<Self> {
        let (outbox, rx) = mpsc::unbounded_channel();
        ctx.runtime.spawn(drain_outbox(
            ctx.clone(),
            record.uid.clone(),
            rx,
            release,
        ));
        let correlator = Arc::new(Self {
            ctx: ctx.clone(),
            record,
            outbox,
            finished: AtomicBool::new(false),
        });
        ctx.records
            .insert(correlator.record.uid.clone(), correlator.clone());
        correlator
    }

    pub fn record(&self) -> &ExecutionRecord {
        &self.record
    }

    pub fn uid(&self) -> &TransactionUid {
        &self.record.uid
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    fn enqueue(&self, item: Outbound) {
        if self.outbox.send(item).is_err() {
            warn!(uid = %self.record.uid, "Correlator queue closed, status dropped");
        }
    }

    /// Announce the transaction; must precede the engine starting the task
    pub fn send_start_message(&self) {
        self.enqueue(self.record.start());
    }

    /// First terminal report wins; later ones are logged and ignored
    fn claim_terminal(&self, outcome: &str) -> bool {
        let claimed = self
            .finished
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if !claimed {
            warn!(uid = %self.record.uid, outcome, "Terminal status already sent, ignoring");
        }
        claimed
    }

    fn success_status(
        &self,
        uid: TransactionUid,
        parent_uid: Option<TransactionUid>,
        out_params: Vec<Value>,
    ) -> Outbound {
        Outbound::Status(BusMessage::SuccessExecutionStatus(SuccessExecutionStatus {
            uid,
            parent_uid,
            in_params: self.record.in_params.clone(),
            out_params,
        }))
    }

    fn gesture_messages(&self, results: &[Option<Value>]) -> Vec<Outbound> {
        let values: Vec<Value> = results
            .iter()
            .map(|v| v.clone().unwrap_or(Value::Null))
            .collect();
        let mut messages = Vec::new();
        for phase in [GesturePhase::Start, GesturePhase::End] {
            match phase {
                GesturePhase::Start => messages.push(self.success_status(
                    self.record.uid.clone(),
                    self.record.parent_uid.clone(),
                    values.clone(),
                )),
                GesturePhase::End => {
                    let end = ExecutionRecord::new(
                        TransactionUid::generate(),
                        Some(self.record.uid.clone()),
                        self.record.action.clone(),
                        None,
                        self.record.in_params.clone(),
                    );
                    debug!(uid = %self.record.uid, end_uid = %end.uid, "Closing gesture");
                    messages.push(end.start());
                    messages.push(self.success_status(
                        end.uid.clone(),
                        end.parent_uid.clone(),
                        values.clone(),
                    ));
                }
            }
        }
        messages
    }
}

impl TaskListener for ResultCorrelator {
    fn on_success(&self, results: Vec<Option<Value>>) -> bool {
        if !self.claim_terminal("success") {
            return true;
        }
        let messages = match &self.record.declaration {
            Some(decl) => vec![self.success_status(
                self.record.uid.clone(),
                self.record.parent_uid.clone(),
                map_outputs(decl, &self.record.in_params, &results),
            )],
            None => self.gesture_messages(&results),
        };
        for message in messages {
            self.enqueue(message);
        }
        self.enqueue(Outbound::Cleanup);
        true
    }

    fn on_failure(&self, reason: FailureReason, frames: Vec<EngineFrame>) -> bool {
        if !self.claim_terminal("failure") {
            return false;
        }
        let engine = self.ctx.engine.clone();
        let error = normalize_failure(&self.record.action, reason, &frames, |symbol| {
            engine.action_for_symbol(symbol)
        });
        info!(
            uid = %self.record.uid,
            action = %self.record.action,
            kind = %error.kind,
            "Execution failed"
        );
        self.enqueue(Outbound::Status(BusMessage::ErrorExecutionStatus(
            ErrorExecutionStatus {
                uid: self.record.uid.clone(),
                parent_uid: self.record.parent_uid.clone(),
                error,
            },
        )));
        self.enqueue(Outbound::Cleanup);
        false
    }

    fn create_sub_task_listener(
        &self,
        uid: TransactionUid,
        action: ActionName,
        args: Vec<Value>,
    ) -> Arc<dyn TaskListener> {
        let declaration = self.ctx.model.get_inherited(&action);
        let record = ExecutionRecord::new(
            uid,
            Some(self.record.uid.clone()),
            action,
            declaration,
            args,
        );
        debug!(
            uid = %record.uid,
            parent_uid = %self.record.uid,
            action = %record.action,
            "Sub-task listener created"
        );
        let child = ResultCorrelator::spawn(self.ctx.clone(), record, None);
        child.send_start_message();
        child
    }

    fn transaction_uid(&self) -> Option<TransactionUid> {
        Some(self.record.uid.clone())
    }
}

impl fmt::Debug for ResultCorrelator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCorrelator")
            .field("uid", &self.record.uid)
            .field("action", &self.record.action)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Sends one correlator's messages in the order they were queued
async fn drain_outbox(
    ctx: Arc<MediatorContext>,
    uid: TransactionUid,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    mut release: Option<LockRelease>,
) {
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Start {
                uid,
                parent_uid,
                action,
                serial,
                in_params,
            } => {
                let serial = match serial {
                    Some(serial) => serial,
                    None => match ctx.serials.next_serial(&uid).await {
                        Ok(serial) => serial,
                        Err(e) => {
                            warn!(uid = %uid, error = %e, "No serial number, sending start without one");
                            0
                        }
                    },
                };
                ctx.send_best_effort(BusMessage::StartExecutionStatus(StartExecutionStatus {
                    uid,
                    parent_uid,
                    action,
                    serial,
                    in_params,
                }))
                .await;
            }
            Outbound::Status(message) => ctx.send_best_effort(message).await,
            Outbound::Cleanup => break,
        }
    }

    if let Some(release) = release.take() {
        release.release();
    }
    ctx.records.remove(&uid);
    debug!(uid = %uid, "Execution record closed");
}
