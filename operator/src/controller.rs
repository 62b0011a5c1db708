//! Lifecycle state machine of `Extension` resources.
//!
//! Every pass looks at the object as the work queue hands it over and does at
//! most one step: add the finalizer, run one actuator phase, or nothing. The
//! status written by a phase, the finalizer and the operation annotation are
//! what the next pass looks at.
use crate::{
    events,
    manager::Context,
    options::ControllerConfig,
    store::{self, object_key},
    Error, Result,
};
use chrono::{DateTime, Utc};
use common::{
    extension::{LastError, LastOperation, LastOperationState, LastOperationType, OperationAnnotation},
    ClusterContext, Extension,
};
use kube::{
    runtime::controller::Action,
    Resource, ResourceExt,
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, instrument, warn};

/// Actuator phase run by a pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Reconcile,
    Restore,
    Migrate,
    Delete,
    ForceDelete,
}

impl Phase {
    /// Operation type recorded in the status for this phase
    #[must_use]
    pub fn operation_type(self, ext: &Extension) -> LastOperationType {
        match self {
            Phase::Reconcile if ext.last_operation().is_none() => LastOperationType::Create,
            Phase::Reconcile => LastOperationType::Reconcile,
            Phase::Restore => LastOperationType::Restore,
            Phase::Migrate => LastOperationType::Migrate,
            Phase::Delete | Phase::ForceDelete => LastOperationType::Delete,
        }
    }
}

/// Time left before an extension last operated on is due for a resync reconcile
#[must_use]
pub fn resync_remaining(ext: &Extension, config: &ControllerConfig, now: DateTime<Utc>) -> Duration {
    let Some(op) = ext.last_operation() else {
        return Duration::ZERO;
    };
    // clock skew into the future counts as nothing elapsed
    let elapsed = (now - op.last_update_time).to_std().unwrap_or_default();
    config.resync_interval.saturating_sub(elapsed)
}

/// Phase requested for an extension that is not being deleted, if any
///
/// Without an operation annotation only a failed last operation is retried,
/// unless annotations are ignored: then spec changes and an elapsed resync
/// interval are reconciled too.
#[must_use]
pub fn requested_phase(ext: &Extension, config: &ControllerConfig, now: DateTime<Utc>) -> Option<Phase> {
    match ext.operation() {
        Some(OperationAnnotation::Reconcile) => return Some(Phase::Reconcile),
        Some(OperationAnnotation::Restore) => return Some(Phase::Restore),
        Some(OperationAnnotation::Migrate) => return Some(Phase::Migrate),
        // force-delete only means something once deletion started
        Some(OperationAnnotation::ForceDelete) | None => {}
    }
    if !ext.last_operation_succeeded() {
        return Some(Phase::Reconcile);
    }
    let implicit = config.ignore_operation_annotation
        && (!ext.generation_observed() || resync_remaining(ext, config, now).is_zero());
    implicit.then_some(Phase::Reconcile)
}

/// Phase to run on an extension being deleted
#[must_use]
pub fn deletion_phase(ext: &Extension) -> Phase {
    if ext.operation() == Some(OperationAnnotation::ForceDelete) {
        Phase::ForceDelete
    } else {
        Phase::Delete
    }
}

#[instrument(skip(ext, ctx), fields(extension = %object_key(&ext)))]
pub async fn reconcile(ext: Arc<Extension>, ctx: Arc<Context>) -> Result<Action> {
    let key = object_key(&ext);
    if !ctx.config.handles(&ext) {
        debug!(
            "ignoring extension of type {} and class {}",
            ext.spec.extension_type,
            ext.class()
        );
        ctx.backoff.reset(&key);
        return Ok(Action::await_change());
    }
    if let Some(wait) = ctx.backoff.pending(&key, ext.metadata.generation) {
        debug!("backing off for {}s", wait.as_secs());
        return Ok(Action::requeue(wait));
    }
    let _timer = ctx.metrics.reconcile.count_and_measure();
    ctx.diagnostics.write().await.last_event = Utc::now();

    let action = if ext.is_deleting() {
        cleanup(&ext, &ctx).await?
    } else {
        apply(&ext, &ctx).await?
    };
    ctx.backoff.reset(&key);
    Ok(action)
}

#[must_use]
pub fn error_policy(ext: Arc<Extension>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = object_key(&ext);
    ctx.metrics.reconcile.reconcile_failure(&ext, error);
    if matches!(error, Error::Cancelled) {
        return Action::await_change();
    }
    let delay = ctx.backoff.failed(&key, ext.metadata.generation);
    warn!(
        "reconcile failed for Extension {key}, retrying in {}s: {error}",
        delay.as_secs()
    );
    Action::requeue(delay)
}

async fn apply(ext: &Extension, ctx: &Context) -> Result<Action> {
    let store = ctx.store.as_ref();
    if !ext.has_finalizer(&ctx.config.finalizer) {
        info!("adding finalizer {}", ctx.config.finalizer);
        store::add_finalizer(store, ext, &ctx.config.finalizer).await?;
        return Ok(Action::await_change());
    }
    let now = Utc::now();
    let Some(phase) = requested_phase(ext, &ctx.config, now) else {
        debug!("extension is up to date");
        let wait = if ctx.config.ignore_operation_annotation {
            resync_remaining(ext, &ctx.config, now)
        } else {
            ctx.config.resync_interval
        };
        return Ok(Action::requeue(wait));
    };
    if ext.is_disabled() {
        let op = phase.operation_type(ext);
        let generation = ext.metadata.generation;
        info!("extension is disabled, skipping {op}");
        store::write_status(store, ext, |s| {
            s.last_operation = Some(LastOperation::new(op, LastOperationState::Succeeded, "extension is disabled"));
            s.last_error = None;
            s.observed_generation = generation;
        })
        .await?;
        clear_operation(ext, ctx).await?;
        return Ok(Action::requeue(ctx.config.resync_interval));
    }
    run_phase(ext, ctx, phase).await
}

async fn cleanup(ext: &Extension, ctx: &Context) -> Result<Action> {
    if !ext.has_finalizer(&ctx.config.finalizer) {
        debug!("no finalizer left, nothing to clean up");
        return Ok(Action::await_change());
    }
    run_phase(ext, ctx, deletion_phase(ext)).await
}

/// Drop the annotation once the phase it requested is done
async fn clear_operation(ext: &Extension, ctx: &Context) -> Result<()> {
    if matches!(
        ext.operation(),
        Some(OperationAnnotation::Reconcile | OperationAnnotation::Restore | OperationAnnotation::Migrate)
    ) {
        ctx.store
            .clear_operation(&ext.namespace().unwrap_or_default(), &ext.name_any())
            .await?;
    }
    Ok(())
}

async fn load_cluster(ctx: &Context, name: &str) -> Result<Option<ClusterContext>> {
    let Some(cluster) = ctx.store.get_cluster(name).await? else {
        return Ok(None);
    };
    Ok(Some(ClusterContext::try_from(&cluster)?))
}

async fn call_actuator(ext: &Extension, ctx: &Context, phase: Phase) -> Result<()> {
    // the Cluster is named after the namespace of its extensions
    let ns = ext.namespace().unwrap_or_default();
    let cluster = load_cluster(ctx, &ns).await?;
    let required = || cluster.as_ref().ok_or_else(|| Error::ClusterNotFound(ns.clone()));
    match phase {
        Phase::Reconcile => ctx.actuator.reconcile(ext, required()?).await,
        Phase::Restore => ctx.actuator.restore(ext, required()?).await,
        Phase::Migrate => ctx.actuator.migrate(ext, required()?).await,
        Phase::Delete => ctx.actuator.delete(ext, cluster.as_ref()).await,
        Phase::ForceDelete => ctx.actuator.force_delete(ext, cluster.as_ref()).await,
    }
}

async fn run_phase(ext: &Extension, ctx: &Context, phase: Phase) -> Result<Action> {
    let store = ctx.store.as_ref();
    let op = phase.operation_type(ext);
    info!("starting {op} ({phase:?})");
    let started = format!("{op} of extension in progress");
    let ext = store::write_status(store, ext, |s| {
        s.last_operation = Some(LastOperation::new(op, LastOperationState::Processing, &started));
    })
    .await?;

    let outcome = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => Err(Error::Cancelled),
        res = call_actuator(&ext, ctx, phase) => res,
    };
    let oref = ext.object_ref(&());
    match outcome {
        Err(Error::Cancelled) => Err(Error::Cancelled),
        Err(e) => {
            let description = e.to_string();
            if let Err(write) = store::write_status(store, &ext, |s| {
                s.last_operation = Some(LastOperation::new(op, LastOperationState::Error, &description));
                s.last_error = Some(LastError {
                    description: description.clone(),
                    last_update_time: Some(Utc::now()),
                });
            })
            .await
            {
                warn!("could not record the failure of {op}: {write}");
            }
            ctx.events
                .publish(&oref, events::from_failure(op, &ext.name_any(), &description))
                .await;
            Err(e)
        }
        Ok(()) => {
            let generation = ext.metadata.generation;
            let ext = store::write_status(store, &ext, |s| {
                s.last_operation = Some(LastOperation::new(
                    op,
                    LastOperationState::Succeeded,
                    &format!("{op} of extension succeeded"),
                ));
                s.last_error = None;
                s.observed_generation = generation;
            })
            .await?;
            ctx.events
                .publish(&oref, events::from_success(op, &ext.name_any()))
                .await;
            info!("{op} succeeded");
            match phase {
                Phase::Delete | Phase::ForceDelete => {
                    store::remove_finalizer(store, &ext, &ctx.config.finalizer).await?;
                    Ok(Action::await_change())
                }
                Phase::Reconcile | Phase::Restore | Phase::Migrate => {
                    clear_operation(&ext, ctx).await?;
                    Ok(Action::requeue(ctx.config.resync_interval))
                }
            }
        }
    }
}
