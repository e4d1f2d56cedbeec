//! Constraint coalescing for unbound procedures.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::bus::messages::{BusMessage, ConstraintResult};
use crate::bus::transport::{Delivery, MessageHandler};
use crate::core::errors::{MediatorError, Result};
use crate::mediator::pool::WorkerPool;
use crate::mediator::MediatorContext;
use crate::model::declaration::Declaration;

pub struct ConstraintCoalescer {
    ctx: Arc<MediatorContext>,
    pool: Arc<WorkerPool>,
}

impl ConstraintCoalescer {
    pub(crate) fn new(ctx: Arc<MediatorContext>, pool: Arc<WorkerPool>) -> Self {
        Self { ctx, pool }
    }
}

/// Parse `source`, lock its closure and merge the constraints of every action in it
pub(crate) async fn coalesce(ctx: &MediatorContext, source: &str) -> Result<String> {
    ctx.ensure_initialized().await?;
    let procedure = ctx
        .engine
        .parse_procedure(source)
        .map_err(|failure| MediatorError::parse(failure.message))?;
    let procedure = Arc::new(procedure);

    ctx.locking
        .with_locked(procedure, |closure, release| async move {
            let target = closure.target().clone();
            let mut decls: Vec<Arc<Declaration>> = closure
                .actions()
                .filter(|d| d.name != target.name)
                .cloned()
                .collect();
            decls.push(target);
            debug!(actions = decls.len(), "Merging constraints");

            let merged = ctx.engine.merge_constraints(&decls).await;
            release.release();
            merged.map_err(|failure| MediatorError::ConstraintCoalesce {
                message: failure.message,
            })
        })
        .await
}

#[async_trait]
impl MessageHandler for ConstraintCoalescer {
    async fn handle(&self, delivery: Delivery) {
        let (message, replier) = delivery.into_parts();
        let BusMessage::ConstraintRequest(request) = message else {
            return;
        };
        let Some(replier) = replier else {
            warn!("Constraint request sent without reply channel");
            return;
        };
        let ctx = self.ctx.clone();
        self.pool.spawn(async move {
            let result = coalesce(&ctx, &request.procedure_source)
                .await
                .map_err(|e| {
                    debug!(error = %e, category = e.category(), "Constraint coalescing failed");
                    e.to_execution_error()
                });
            replier.reply(BusMessage::ConstraintResult(ConstraintResult { result }));
        });
    }
}
