use kube::api::{Api, PostParams};
use tracing::*;

use crate::unit_types::Unit;
use crate::Error;

/// Token that blocks physical deletion of a Unit until the pre-delete hook
/// has run.
pub const UNIT_FINALIZER: &str = "unit.finalizers.custom.my.crd.com";

/// What the finalizer step decided about the rest of the reconcile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizerOutcome {
    /// Token guaranteed present, carry on converging owned resources.
    Active,
    /// Deletion in progress; no convergence runs, the platform garbage
    /// collects owned resources through their owner references.
    Terminating,
}

pub fn has_finalizer(unit: &Unit) -> bool {
    unit.metadata
        .finalizers
        .as_ref()
        .map(|tokens| tokens.iter().any(|t| t == UNIT_FINALIZER))
        .unwrap_or(false)
}

fn add_finalizer(unit: &mut Unit) {
    unit.metadata
        .finalizers
        .get_or_insert_with(Vec::new)
        .push(UNIT_FINALIZER.to_string());
}

fn remove_finalizer(unit: &mut Unit) {
    if let Some(tokens) = unit.metadata.finalizers.as_mut() {
        tokens.retain(|t| t != UNIT_FINALIZER);
    }
}

/// Pre-delete extension point. Owner references already cascade the removal
/// of owned resources, so nothing is required here today; anything that must
/// happen before the Unit disappears goes in this function. An error keeps
/// the finalizer token in place and the deletion is retried.
fn pre_delete(_unit: &Unit) -> Result<(), Error> {
    Ok(())
}

/// Terminating transition: the token comes off only after the hook succeeds.
/// A hook error leaves the token in place so the platform keeps the object
/// around for a retry.
fn release_token(
    unit: &mut Unit,
    hook: impl FnOnce(&Unit) -> Result<(), Error>,
) -> Result<(), Error> {
    hook(unit)?;
    remove_finalizer(unit);
    Ok(())
}

/// Run one finalizer lifecycle step for the Unit.
///
/// Active: make sure the token is persisted before any owned resource ever
/// gets created (idempotent). Terminating: run the hook, then release the
/// token so the platform can purge the object.
pub async fn finalizer_step(unit: &mut Unit, api: &Api<Unit>) -> Result<FinalizerOutcome, Error> {
    let name = unit
        .metadata
        .name
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    let namespace = unit
        .metadata
        .namespace
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;

    if unit.metadata.deletion_timestamp.is_none() {
        if !has_finalizer(unit) {
            add_finalizer(unit);
            info!("Add finalizer to Unit {}/{}", namespace, name);
            *unit = api
                .replace(&name, &PostParams::default(), unit)
                .await
                .map_err(Error::FinalizerUpdateFailed)?;
        }
        Ok(FinalizerOutcome::Active)
    } else {
        if has_finalizer(unit) {
            release_token(unit, pre_delete)?;
            info!("Remove finalizer from Unit {}/{}", namespace, name);
            api.replace(&name, &PostParams::default(), unit)
                .await
                .map_err(Error::FinalizerUpdateFailed)?;
        }
        Ok(FinalizerOutcome::Terminating)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit_types::{fixtures, UnitCategory};

    #[test]
    fn token_membership_round_trip() {
        let mut unit = fixtures::unit(UnitCategory::Deployment);
        assert!(!has_finalizer(&unit));

        add_finalizer(&mut unit);
        assert!(has_finalizer(&unit));

        remove_finalizer(&mut unit);
        assert!(!has_finalizer(&unit));
        assert!(unit.metadata.finalizers.unwrap().is_empty());
    }

    #[test]
    fn foreign_tokens_survive_removal() {
        let mut unit = fixtures::unit(UnitCategory::Deployment);
        unit.metadata.finalizers = Some(vec!["other.example.com/protect".to_string()]);
        add_finalizer(&mut unit);
        remove_finalizer(&mut unit);
        assert_eq!(
            unit.metadata.finalizers,
            Some(vec!["other.example.com/protect".to_string()])
        );
    }

    #[test]
    fn pre_delete_hook_is_a_no_op() {
        let unit = fixtures::unit(UnitCategory::Deployment);
        assert!(pre_delete(&unit).is_ok());
    }

    #[test]
    fn failed_hook_keeps_token() {
        let mut unit = fixtures::unit(UnitCategory::Deployment);
        add_finalizer(&mut unit);
        let result = release_token(&mut unit, |_| Err(Error::MissingObjectKey("hook")));
        assert!(result.is_err());
        assert!(has_finalizer(&unit));
    }

    #[test]
    fn token_comes_off_only_after_hook_success() {
        let mut unit = fixtures::unit(UnitCategory::Deployment);
        add_finalizer(&mut unit);
        release_token(&mut unit, pre_delete).unwrap();
        assert!(!has_finalizer(&unit));
    }
}
