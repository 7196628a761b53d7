use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::crd::{QuotaPoolSpec, ResourceQuota};
use crate::quantity;

/* ============================= PLANNING ============================= */

/// Desired lending limit for one resource: capped at
/// `max(0, nominal − unschedulable)` while the resource is unschedulable
/// anywhere, uncapped (`None`) otherwise.
pub fn desired_lending_limit(
    resource: &ResourceQuota,
    unschedulable_totals: &BTreeMap<String, i64>,
) -> Option<Quantity> {
    let unavailable = unschedulable_totals.get(&resource.name)?;
    Some(quantity::format_millis(quantity::saturating_sub(
        &resource.nominal_quota,
        *unavailable,
    )))
}

/// Recompute the lending limits of the first flavor of the first resource
/// group. Returns the replacement resource list when any limit changed, or
/// `None` when the pool is already correct. Other groups and flavors are
/// left untouched.
pub fn plan_lending_update(
    spec: &QuotaPoolSpec,
    unschedulable_totals: &BTreeMap<String, i64>,
) -> Option<Vec<ResourceQuota>> {
    let flavor = spec.resource_groups.first()?.flavors.first()?;

    let mut changed = false;
    let updated: Vec<ResourceQuota> = flavor
        .resources
        .iter()
        .map(|resource| {
            let desired = desired_lending_limit(resource, unschedulable_totals);
            if !limits_equal(resource.lending_limit.as_ref(), desired.as_ref()) {
                changed = true;
            }
            ResourceQuota {
                lending_limit: desired,
                ..resource.clone()
            }
        })
        .collect();

    changed.then_some(updated)
}

// Limits compare by value, not by spelling ("2" == "2000m").
fn limits_equal(current: Option<&Quantity>, desired: Option<&Quantity>) -> bool {
    match (current, desired) {
        (None, None) => true,
        (Some(a), Some(b)) => quantity::parse_millis(a) == quantity::parse_millis(b),
        _ => false,
    }
}

/// Spec with the replacement resource list applied to the first flavor of
/// the first group, for the pool patch.
pub fn apply_lending_update(spec: &QuotaPoolSpec, resources: Vec<ResourceQuota>) -> QuotaPoolSpec {
    let mut updated = spec.clone();
    if let Some(flavor) = updated
        .resource_groups
        .first_mut()
        .and_then(|g| g.flavors.first_mut())
    {
        flavor.resources = resources;
    }
    updated
}

/* ============================= TESTS ============================= */
