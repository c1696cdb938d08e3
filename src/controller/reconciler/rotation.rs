//! # Credential Rotation
//!
//! Replaces a binding's credentials on a schedule or on demand.
//!
//! Rotation renames the current remote binding, records it as a *stale*
//! sibling `ServiceBinding` that keeps the old credentials alive for the
//! configured TTL, and then creates a fresh remote binding under the
//! original name. A stale binding is deleted once its TTL has elapsed and
//! the binding it was rotated from is `Ready` again; it is never deleted
//! while the replacement is not usable.

use super::classify::is_transient;
use super::engine::persist;
use super::resource::Reconcilable;
use super::types::{Reconciler, ReconcilerError};
use crate::constants::{
    FORCE_ROTATE_ANNOTATION, MAX_LABEL_VALUE_LEN, STALE_BINDING_ID_LABEL,
    STALE_BINDING_ORIGINAL_NAME_ANNOTATION, STALE_BINDING_ROTATION_OF_LABEL,
};
use crate::controller::conditions::{self, reasons, Conditioned};
use crate::controller::duration::parse_kubernetes_duration;
use crate::crd::{CredentialRotationPolicy, OperationType, ServiceBinding};
use crate::observability::metrics;
use crate::sm::ServiceManagerClient;
use crate::store::StoreError;
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::runtime::controller::Action;
use kube::Resource;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub(crate) fn timestamp(time: &Time) -> Option<DateTime<Utc>> {
    let value = serde_json::to_value(time).ok()?;
    DateTime::parse_from_rfc3339(value.as_str()?)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn force_requested(binding: &ServiceBinding) -> bool {
    binding
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(FORCE_ROTATE_ANNOTATION))
}

/// Enabled policy on a bound, `Ready`, non-stale binding
fn rotation_policy(binding: &ServiceBinding) -> Option<&CredentialRotationPolicy> {
    let policy = binding.spec.cred_rotation_policy.as_ref().filter(|p| p.enabled)?;
    let settled = !binding.is_stale()
        && binding.binding_id().is_some()
        && conditions::is_true(binding.conditions(), conditions::READY);
    settled.then_some(policy)
}

/// Next scheduled rotation time
fn scheduled_at(binding: &ServiceBinding, policy: &CredentialRotationPolicy) -> Option<DateTime<Utc>> {
    let frequency = match parse_kubernetes_duration(&policy.rotation_frequency) {
        Ok(frequency) => frequency,
        Err(e) => {
            debug!(error = %e, "ignoring rotation policy with invalid frequency");
            return None;
        }
    };
    let last = binding
        .status
        .as_ref()
        .and_then(|s| s.last_credentials_rotation_time.as_deref())
        .and_then(parse_rfc3339)
        .or_else(|| binding.metadata.creation_timestamp.as_ref().and_then(timestamp))?;
    chrono::Duration::from_std(frequency).ok().map(|frequency| last + frequency)
}

/// Whether the binding's credentials should be rotated now
///
/// Rotation needs an enabled policy and a `Ready` binding that is not
/// itself a stale leftover. It is due when forced through the annotation,
/// when a previous rotation was interrupted, or once `rotationFrequency`
/// has passed since the last rotation (or creation).
#[must_use]
pub fn rotation_due(binding: &ServiceBinding, now: DateTime<Utc>) -> bool {
    let Some(policy) = rotation_policy(binding) else {
        return false;
    };
    if force_requested(binding)
        || conditions::is_true(binding.conditions(), conditions::CRED_ROTATION_IN_PROGRESS)
    {
        return true;
    }
    scheduled_at(binding, policy).is_some_and(|at| now >= at)
}

/// Time left until the next scheduled rotation, at least one second
#[must_use]
pub fn next_rotation_in(binding: &ServiceBinding, now: DateTime<Utc>) -> Option<Duration> {
    let at = scheduled_at(binding, rotation_policy(binding)?)?;
    let remaining = (at - now).to_std().unwrap_or_default();
    Some(remaining.max(Duration::from_secs(1)))
}

/// What happens to a stale binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleDecision {
    Delete,
    Wait { message: String, retry_in: Duration },
}

/// Facts about a stale binding and the binding it was rotated from
#[derive(Debug, Clone, PartialEq)]
pub struct RotationRecord {
    pub original_name: String,
    /// Remote binding ID held by the stale binding
    pub stale_binding_id: String,
    pub ttl: Duration,
    pub stale_since: Option<DateTime<Utc>>,
    pub original_ready: bool,
}

impl RotationRecord {
    /// Build the record of a stale binding; `None` without a rotation-of label
    #[must_use]
    pub fn new(stale: &ServiceBinding, original: Option<&ServiceBinding>) -> Option<Self> {
        let labels = stale.metadata.labels.as_ref();
        labels?.get(STALE_BINDING_ROTATION_OF_LABEL)?;
        let original_name = original_name(stale)?;
        let ttl = stale
            .spec
            .cred_rotation_policy
            .as_ref()
            .and_then(|p| parse_kubernetes_duration(&p.rotated_binding_ttl).ok())
            .unwrap_or_default();
        Some(Self {
            original_name,
            stale_binding_id: labels
                .and_then(|l| l.get(STALE_BINDING_ID_LABEL))
                .cloned()
                .unwrap_or_default(),
            ttl,
            stale_since: stale.metadata.creation_timestamp.as_ref().and_then(timestamp),
            original_ready: original.is_some_and(|o| {
                o.metadata.deletion_timestamp.is_none()
                    && conditions::is_true(o.conditions(), conditions::READY)
            }),
        })
    }

    #[must_use]
    pub fn decide(&self, now: DateTime<Utc>, long_poll: Duration) -> StaleDecision {
        let expires = self
            .stale_since
            .zip(chrono::Duration::from_std(self.ttl).ok())
            .map(|(since, ttl)| since + ttl);
        if let Some(remaining) = expires
            .map(|at| at - now)
            .and_then(|r| r.to_std().ok())
            .filter(|r| !r.is_zero())
        {
            return StaleDecision::Wait {
                message: "waiting for the rotated binding TTL to elapse".to_string(),
                retry_in: remaining.min(long_poll),
            };
        }
        if !self.original_ready {
            return StaleDecision::Wait {
                message: format!(
                    "waiting for binding {} to become ready before deleting",
                    self.original_name
                ),
                retry_in: long_poll,
            };
        }
        StaleDecision::Delete
    }
}

/// Name of the binding a stale binding was rotated from
fn original_name(stale: &ServiceBinding) -> Option<String> {
    stale
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(STALE_BINDING_ORIGINAL_NAME_ANNOTATION))
        .or_else(|| {
            stale
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(STALE_BINDING_ROTATION_OF_LABEL))
        })
        .filter(|n| !n.is_empty())
        .cloned()
}

/// Delete a stale binding once it is no longer needed
pub async fn handle_stale(
    binding: &mut ServiceBinding,
    ctx: &Reconciler,
) -> Result<Action, ReconcilerError> {
    let namespace = binding.metadata.namespace.clone().unwrap_or_default();
    let name = binding.metadata.name.clone().unwrap_or_default();
    let original = match original_name(binding) {
        Some(original) => ctx.bindings.get(&namespace, &original).await?,
        None => None,
    };
    let decision = match RotationRecord::new(binding, original.as_ref()) {
        Some(record) => record.decide(Utc::now(), ctx.config.long_poll_interval()),
        None => {
            warn!("stale binding {} has no rotation-of label", name);
            StaleDecision::Delete
        }
    };
    match decision {
        StaleDecision::Delete => {
            info!("deleting stale binding {}", name);
            ctx.bindings.delete(&namespace, &name).await?;
            Ok(Action::await_change())
        }
        StaleDecision::Wait { message, retry_in } => {
            let unchanged = conditions::find(binding.conditions(), conditions::PENDING_TERMINATION)
                .is_some_and(|c| c.is_true() && c.message.as_deref() == Some(message.as_str()));
            if !unchanged {
                binding.set_pending_termination(&message);
                persist(binding, ctx).await?;
            }
            debug!(retry_in = ?retry_in, "{}", message);
            metrics::increment_requeues_total("stale-binding");
            Ok(Action::requeue(retry_in))
        }
    }
}

fn truncate_label(value: &str) -> String {
    value.chars().take(MAX_LABEL_VALUE_LEN).collect()
}

/// Suffix of the stale names, kept in status so a retried rotation reuses it
fn rotation_suffix(binding: &mut ServiceBinding) -> String {
    let status = binding.status_mut();
    status
        .rotation_suffix
        .get_or_insert_with(|| uuid::Uuid::new_v4().simple().to_string()[..6].to_string())
        .clone()
}

/// The stale sibling holding the renamed remote binding
fn stale_binding(binding: &ServiceBinding, suffix: &str, binding_id: &str) -> ServiceBinding {
    let name = binding.metadata.name.clone().unwrap_or_default();
    let mut spec = binding.spec.clone();
    spec.external_name = Some(format!("{}-{suffix}", binding.external_name()));
    spec.secret_name = Some(format!("{}-{suffix}", binding.secret_name()));
    spec.cred_rotation_policy = spec
        .cred_rotation_policy
        .map(|policy| CredentialRotationPolicy {
            enabled: false,
            ..policy
        });

    let mut stale = ServiceBinding::new(&format!("{name}-{suffix}"), spec);
    stale.metadata.namespace = binding.metadata.namespace.clone();
    stale.metadata.labels = Some(BTreeMap::from([
        (STALE_BINDING_ID_LABEL.to_string(), binding_id.to_string()),
        (
            STALE_BINDING_ROTATION_OF_LABEL.to_string(),
            truncate_label(&name),
        ),
    ]));
    stale.metadata.annotations = Some(BTreeMap::from([(
        STALE_BINDING_ORIGINAL_NAME_ANNOTATION.to_string(),
        name,
    )]));
    stale.metadata.owner_references = binding.controller_owner_ref(&()).map(|r| vec![r]);
    stale
}

/// Rotate the binding's credentials
pub async fn rotate(
    binding: &mut ServiceBinding,
    ctx: &Reconciler,
    client: &dyn ServiceManagerClient,
) -> Result<Action, ReconcilerError> {
    let Some(binding_id) = binding.binding_id().map(str::to_string) else {
        return Ok(Action::await_change());
    };
    let resumed = binding
        .status
        .as_ref()
        .is_some_and(|s| s.rotation_suffix.is_some());
    let suffix = rotation_suffix(binding);
    if !resumed || !conditions::is_true(binding.conditions(), conditions::CRED_ROTATION_IN_PROGRESS) {
        binding.set_cred_rotation_in_progress(reasons::CRED_ROTATING, "rotating binding credentials");
        persist(binding, ctx).await?;
    }
    if force_requested(binding) {
        let patch = serde_json::json!({ "annotations": { FORCE_ROTATE_ANNOTATION: null } });
        *binding = ctx.bindings.patch_metadata(binding, patch).await?;
    }

    let name = binding.metadata.name.clone().unwrap_or_default();
    let stale_external_name = format!("{}-{suffix}", binding.external_name());
    let stale_name = format!("{name}-{suffix}");
    info!(stale = %stale_name, "rotating credentials of binding {}", name);
    // An interrupted rotation may have renamed the remote binding already
    let renamed = resumed
        && client
            .get_binding(&binding_id)
            .await
            .is_ok_and(|remote| remote.name == stale_external_name);
    if renamed {
        debug!("remote binding {} already renamed", binding_id);
    } else if let Err(e) = client
        .rename_binding(&binding_id, &stale_external_name, &stale_name)
        .await
    {
        metrics::record_remote_operation("rename_binding", "error");
        let message = e.to_string();
        if is_transient(&e) {
            warn!(error = %message, "failed to rename binding, will retry");
            return Err(ReconcilerError::Transient {
                message,
                retry_after: e.retry_after(),
            });
        }
        error!(error = %message, "failed to rename binding, rotation abandoned");
        conditions::remove(binding.conditions_mut(), conditions::CRED_ROTATION_IN_PROGRESS);
        binding.status_mut().rotation_suffix = None;
        persist(binding, ctx).await?;
        return Ok(Action::await_change());
    } else {
        metrics::record_remote_operation("rename_binding", "success");
    }

    let stale = stale_binding(binding, &suffix, &binding_id);
    match ctx.bindings.create(&stale).await {
        Ok(_) | Err(StoreError::AlreadyExists(_)) => {}
        Err(e) => return Err(e.into()),
    }
    metrics::increment_credential_rotations();

    binding.set_remote_id(None);
    binding.status_mut().rotation_suffix = None;
    binding.set_ready_flag(false);
    binding.set_in_progress(Some(OperationType::Create), "creating new credentials");
    persist(binding, ctx).await?;
    binding.create(ctx, client).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ServiceBindingStatus;

    fn time(value: &str) -> Time {
        serde_json::from_value(serde_json::json!(value)).unwrap()
    }

    fn now() -> DateTime<Utc> {
        parse_rfc3339("2026-03-01T12:00:00Z").unwrap()
    }

    fn binding(policy: serde_json::Value) -> ServiceBinding {
        let mut binding = ServiceBinding::new(
            "creds",
            serde_json::from_value(serde_json::json!({
                "serviceInstanceName": "db",
                "credRotationPolicy": policy,
            }))
            .unwrap(),
        );
        binding.metadata.namespace = Some("shop".to_string());
        binding.metadata.uid = Some("uid-creds".to_string());
        binding.metadata.creation_timestamp = Some(time("2026-03-01T00:00:00Z"));
        binding.status = Some(ServiceBindingStatus {
            binding_id: Some("binding-1".to_string()),
            ..Default::default()
        });
        binding.set_success(Some(OperationType::Create));
        binding
    }

    fn policy(frequency: &str, ttl: &str) -> serde_json::Value {
        serde_json::json!({
            "enabled": true,
            "rotationFrequency": frequency,
            "rotatedBindingTTL": ttl,
        })
    }

    #[test]
    fn test_rotation_due_after_frequency() {
        assert!(rotation_due(&binding(policy("6h", "1h")), now()));
        assert!(!rotation_due(&binding(policy("24h", "1h")), now()));
    }

    #[test]
    fn test_rotation_due_uses_last_rotation_time() {
        let mut b = binding(policy("6h", "1h"));
        b.status_mut().last_credentials_rotation_time = Some("2026-03-01T10:00:00Z".to_string());
        assert!(!rotation_due(&b, now()));
    }

    #[test]
    fn test_rotation_needs_enabled_policy_and_ready_binding() {
        let mut disabled = binding(policy("1h", "1h"));
        disabled.spec.cred_rotation_policy = disabled
            .spec
            .cred_rotation_policy
            .map(|p| CredentialRotationPolicy { enabled: false, ..p });
        assert!(!rotation_due(&disabled, now()));

        let mut failed = binding(policy("1h", "1h"));
        failed.set_failure(Some(OperationType::Update), "broken");
        assert!(!rotation_due(&failed, now()));
    }

    #[test]
    fn test_force_annotation_triggers_rotation() {
        let mut b = binding(policy("720h", "1h"));
        b.metadata.annotations = Some(BTreeMap::from([(
            FORCE_ROTATE_ANNOTATION.to_string(),
            "true".to_string(),
        )]));
        assert!(rotation_due(&b, now()));
    }

    #[test]
    fn test_stale_binding_shape() {
        let original = binding(policy("1h", "10m"));
        let stale = stale_binding(&original, "a1b2c3", "binding-1");
        assert_eq!(stale.metadata.name.as_deref(), Some("creds-a1b2c3"));
        assert_eq!(stale.secret_name(), "creds-a1b2c3");
        assert_eq!(stale.external_name(), "creds-a1b2c3");
        assert!(stale.is_stale());
        assert!(!stale.rotation_enabled());
        assert_eq!(original_name(&stale).as_deref(), Some("creds"));
        let owner = &stale.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.uid, "uid-creds");
        assert_eq!(owner.controller, Some(true));
    }

    #[test]
    fn test_rotation_of_label_is_truncated() {
        let long = "b".repeat(80);
        let mut original = binding(policy("1h", "10m"));
        original.metadata.name = Some(long.clone());
        let stale = stale_binding(&original, "a1b2c3", "binding-1");
        let label = &stale.metadata.labels.as_ref().unwrap()[STALE_BINDING_ROTATION_OF_LABEL];
        assert_eq!(label.len(), MAX_LABEL_VALUE_LEN);
        assert_eq!(original_name(&stale), Some(long));
    }

    #[test]
    fn test_stale_waits_for_ttl_then_original() {
        let original = binding(policy("1h", "10m"));
        let mut stale = stale_binding(&original, "a1b2c3", "binding-1");
        stale.metadata.creation_timestamp = Some(time("2026-03-01T11:55:00Z"));
        let long_poll = Duration::from_secs(60);

        let record = RotationRecord::new(&stale, Some(&original)).unwrap();
        assert_eq!(record.stale_binding_id, "binding-1");
        match record.decide(now(), long_poll) {
            StaleDecision::Wait { retry_in, .. } => assert_eq!(retry_in, long_poll),
            other => panic!("unexpected {other:?}"),
        }

        stale.metadata.creation_timestamp = Some(time("2026-03-01T11:00:00Z"));
        let record = RotationRecord::new(&stale, Some(&original)).unwrap();
        assert_eq!(record.decide(now(), long_poll), StaleDecision::Delete);
    }

    #[test]
    fn test_stale_is_kept_while_original_not_ready() {
        let mut original = binding(policy("1h", "10m"));
        let mut stale = stale_binding(&original, "a1b2c3", "binding-1");
        stale.metadata.creation_timestamp = Some(time("2026-03-01T10:00:00Z"));
        original.set_in_progress(Some(OperationType::Create), "");

        let record = RotationRecord::new(&stale, Some(&original)).unwrap();
        assert!(matches!(
            record.decide(now(), Duration::from_secs(60)),
            StaleDecision::Wait { .. }
        ));
        let missing = RotationRecord::new(&stale, None).unwrap();
        assert!(!missing.original_ready);
        assert!(matches!(
            missing.decide(now(), Duration::from_secs(60)),
            StaleDecision::Wait { .. }
        ));
    }

    #[test]
    fn test_record_requires_rotation_of_label() {
        let original = binding(policy("1h", "10m"));
        let mut stale = stale_binding(&original, "a1b2c3", "binding-1");
        stale
            .metadata
            .labels
            .as_mut()
            .unwrap()
            .remove(STALE_BINDING_ROTATION_OF_LABEL);
        assert!(RotationRecord::new(&stale, Some(&original)).is_none());
    }
}
