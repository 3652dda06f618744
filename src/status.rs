use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::api::{Api, Patch, PatchParams};
use serde_json::json;
use tracing::*;

use crate::unit_types::Unit;
use crate::Error;

/// Persist only when the aggregated status really moved; `lastUpdateTime` is
/// stamped after the comparison so the timestamp itself can never be the
/// difference.
pub fn status_changed(original: &Unit, updated: &Unit) -> bool {
    original.status != updated.status
}

pub fn stamp_last_update(unit: &mut Unit) {
    unit.status
        .get_or_insert_with(Default::default)
        .last_update_time = Some(metav1::Time(Utc::now()));
}

/// Compare the working copy's status against the fetched one and push it to
/// the status subresource on difference. Returns whether a persist happened.
pub async fn persist_if_changed(
    original: &Unit,
    updated: &mut Unit,
    api: &Api<Unit>,
) -> Result<bool, Error> {
    if !status_changed(original, updated) {
        return Ok(false);
    }

    let name = updated
        .metadata
        .name
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    let namespace = updated
        .metadata
        .namespace
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;

    stamp_last_update(updated);
    info!("Update Unit {}/{} status", namespace, name);
    api.patch_status(
        &name,
        &PatchParams::default(),
        &Patch::Merge(json!({ "status": updated.status })),
    )
    .await
    .map_err(Error::StatusUpdateFailed)?;
    Ok(true)
}
