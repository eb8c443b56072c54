//! One-time provisioning of zones and push subscriptions.

use std::collections::BTreeSet;

use arbor_core::prefs::{self, Preferences};
use tracing::info;

use crate::error::ReplicationError;
use crate::remote::RemoteDatabase;

/// Preference key listing zones already provisioned on this device.
pub const ZONES_READY_KEY: &str = "cloud.zones_ready";

/// Make sure `zone` and its subscription exist remotely.
///
/// The remote is only contacted the first time; afterwards a persisted
/// flag short-circuits. Returns whether provisioning calls were made.
///
/// # Errors
///
/// Returns a remote or preferences error; the flag is only written after
/// both remote calls succeed.
#[tracing::instrument(skip(remote, prefs))]
pub async fn ensure_zone_ready(
    remote: &dyn RemoteDatabase,
    prefs: &dyn Preferences,
    zone: &str,
) -> Result<bool, ReplicationError> {
    let mut ready: BTreeSet<String> =
        prefs::get_json(prefs, ZONES_READY_KEY)?.unwrap_or_default();
    if ready.contains(zone) {
        return Ok(false);
    }

    remote.ensure_zone_exists(zone).await?;
    remote.ensure_subscription_exists(zone).await?;

    ready.insert(zone.to_string());
    prefs::set_json(prefs, ZONES_READY_KEY, &ready)?;
    info!(zone, "provisioned remote zone");
    Ok(true)
}

/// Forget that `zone` was provisioned, e.g. after the remote was reset.
///
/// # Errors
///
/// Returns a preferences error.
pub fn forget_zone(prefs: &dyn Preferences, zone: &str) -> Result<(), ReplicationError> {
    let mut ready: BTreeSet<String> =
        prefs::get_json(prefs, ZONES_READY_KEY)?.unwrap_or_default();
    if ready.remove(zone) {
        prefs::set_json(prefs, ZONES_READY_KEY, &ready)?;
    }
    Ok(())
}
