//! # ServiceInstance Reconcile Tests
//!
//! End-to-end reconcile scenarios against in-memory stores and a fake
//! service manager.

mod common;

use common::{is_ready, succeeded_reason, Env, NAMESPACE};
use kube::runtime::controller::Action;
use service_manager_controller::controller::conditions::{self, reasons, Conditioned};
use service_manager_controller::controller::reconciler::ReconcilerError;
use service_manager_controller::sm::{OperationState, RemoteInstance, SmError};
use service_manager_controller::store::ObjectStore;

#[tokio::test]
async fn test_first_reconcile_adds_finalizer_and_pending_condition() {
    let env = Env::new();
    env.add_instance("db");

    let action = env.reconcile_instance("db").await.unwrap();
    assert_eq!(action, Action::await_change());

    let instance = env.instance("db");
    assert!(instance
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|f| f == "services.operator.io/finalizer")));
    assert_eq!(succeeded_reason(&instance), reasons::PENDING);
    assert!(!is_ready(&instance));
    assert!(env.fake.calls().is_empty());
}

#[tokio::test]
async fn test_synchronous_provision_makes_instance_ready() {
    let env = Env::new();
    env.add_instance("db");
    env.reconcile_instance("db").await.unwrap();

    let action = env.reconcile_instance("db").await.unwrap();
    assert_eq!(action, Action::await_change());

    let instance = env.instance("db");
    let status = instance.status.clone().unwrap();
    assert_eq!(status.instance_id.as_deref(), Some("instance-1"));
    assert_eq!(status.observed_generation, 1);
    assert!(status.ready);
    assert!(status.operation_url.is_none());
    assert_eq!(status.tags, vec!["mongo".to_string(), "nosql".to_string()]);
    assert_eq!(succeeded_reason(&instance), reasons::CREATED);
    assert!(is_ready(&instance));
    assert_eq!(env.fake.count("provision"), 1);
}

#[tokio::test]
async fn test_accepted_provision_is_polled_until_done() {
    let env = Env::new();
    env.add_instance("db");
    env.reconcile_instance("db").await.unwrap();
    env.fake.accept_next("provision", "op-1");

    let action = env.reconcile_instance("db").await.unwrap();
    assert_eq!(action, Action::requeue(env.ctx.config.poll_interval()));
    let instance = env.instance("db");
    let url = instance.status.as_ref().unwrap().operation_url.clone().unwrap();
    assert_eq!(url, "/v1/service_instances/instance-1/operations/op-1");
    assert_eq!(succeeded_reason(&instance), reasons::CREATE_IN_PROGRESS);
    assert!(!is_ready(&instance));

    let action = env.reconcile_instance("db").await.unwrap();
    assert_eq!(action, Action::requeue(env.ctx.config.poll_interval()));
    assert_eq!(env.fake.count("status"), 1);

    env.fake.set_operation_state(&url, OperationState::Succeeded);
    let action = env.reconcile_instance("db").await.unwrap();
    assert_eq!(action, Action::await_change());

    let instance = env.instance("db");
    assert!(instance.status.as_ref().unwrap().operation_url.is_none());
    assert!(is_ready(&instance));
    assert_eq!(env.fake.count("provision"), 1);
}

#[tokio::test]
async fn test_failed_operation_marks_instance_failed() {
    let env = Env::new();
    env.add_instance("db");
    env.reconcile_instance("db").await.unwrap();
    env.fake.accept_next("provision", "op-1");
    env.reconcile_instance("db").await.unwrap();

    env.fake.set_operation_state(
        "/v1/service_instances/instance-1/operations/op-1",
        OperationState::Failed,
    );
    let action = env.reconcile_instance("db").await.unwrap();
    assert_eq!(action, Action::await_change());

    let instance = env.instance("db");
    assert!(conditions::is_true(instance.conditions(), conditions::FAILED));
    assert_eq!(succeeded_reason(&instance), reasons::CREATE_FAILED);
    assert!(instance.is_failed());
}

#[tokio::test]
async fn test_settled_instance_makes_no_remote_calls() {
    let env = Env::new();
    env.ready_instance("db").await;
    env.fake.clear_calls();
    let writes = env.instances.writes();

    for _ in 0..3 {
        let action = env.reconcile_instance("db").await.unwrap();
        assert_eq!(action, Action::await_change());
    }
    assert!(env.fake.calls().is_empty());
    assert_eq!(env.instances.writes(), writes);
}

#[tokio::test]
async fn test_lost_status_write_does_not_provision_twice() {
    let env = Env::new();
    env.add_instance("db");
    env.reconcile_instance("db").await.unwrap();

    // The status write after the provision call conflicts; the retry must
    // find the remote instance instead of creating another one
    env.instances.inject_conflicts(1);
    let action = env.reconcile_instance("db").await.unwrap();
    assert_eq!(action, Action::await_change());

    let instance = env.instance("db");
    assert_eq!(
        instance.status.as_ref().unwrap().instance_id.as_deref(),
        Some("instance-1")
    );
    assert!(is_ready(&instance));
    assert_eq!(env.fake.count("provision"), 1);
    assert_eq!(env.fake.count("list_instances"), 2);
}

#[tokio::test]
async fn test_existing_remote_instance_is_adopted() {
    let env = Env::new();
    env.fake.insert_instance(RemoteInstance {
        id: "legacy-1".to_string(),
        name: "db".to_string(),
        service_plan_id: "plan-mongo-small".to_string(),
        ready: true,
        shared: None,
        labels: env.correlation_labels("db"),
        last_operation: None,
    });
    env.add_instance("db");
    env.reconcile_instance("db").await.unwrap();
    env.reconcile_instance("db").await.unwrap();

    let instance = env.instance("db");
    assert_eq!(instance.instance_id(), Some("legacy-1"));
    assert!(is_ready(&instance));
    assert_eq!(env.fake.count("provision"), 0);
}

#[tokio::test]
async fn test_transient_provision_failure_is_retried() {
    let env = Env::new();
    env.add_instance("db");
    env.reconcile_instance("db").await.unwrap();
    env.fake.fail_next("provision", SmError::api(503, "unavailable"));

    let err = env.reconcile_instance("db").await.unwrap_err();
    assert!(matches!(err, ReconcilerError::Transient { .. }));
    let instance = env.instance("db");
    assert_eq!(succeeded_reason(&instance), reasons::CREATE_IN_PROGRESS);
    assert!(!instance.is_failed());

    env.reconcile_instance("db").await.unwrap();
    assert!(is_ready(&env.instance("db")));
    assert_eq!(env.fake.count("provision"), 2);
}

#[tokio::test]
async fn test_permanent_provision_failure_waits_for_spec_change() {
    let env = Env::new();
    env.add_instance("db");
    env.reconcile_instance("db").await.unwrap();
    env.fake.fail_next("provision", SmError::api(400, "bad parameters"));

    let action = env.reconcile_instance("db").await.unwrap();
    assert_eq!(action, Action::await_change());
    assert!(env.instance("db").is_failed());

    env.reconcile_instance("db").await.unwrap();
    assert_eq!(env.fake.count("provision"), 1);
}

#[tokio::test]
async fn test_unknown_plan_is_rejected_without_provisioning() {
    let env = Env::new();
    env.add_instance("db");
    env.instances.edit(NAMESPACE, "db", true, |i| {
        i.spec.service_plan_name = "huge".to_string();
    });
    env.reconcile_instance("db").await.unwrap();
    env.reconcile_instance("db").await.unwrap();

    let instance = env.instance("db");
    assert!(instance.is_failed());
    assert_eq!(env.fake.count("provision"), 0);
}

#[tokio::test]
async fn test_spec_change_updates_remote_instance() {
    let env = Env::new();
    env.ready_instance("db").await;
    env.instances.edit(NAMESPACE, "db", true, |i| {
        i.spec.external_name = Some("orders-db".to_string());
    });

    env.reconcile_instance("db").await.unwrap();

    let instance = env.instance("db");
    assert_eq!(succeeded_reason(&instance), reasons::UPDATED);
    assert_eq!(instance.status.as_ref().unwrap().observed_generation, 2);
    assert_eq!(env.fake.instance("instance-1").unwrap().name, "orders-db");
    assert_eq!(env.fake.count("update_instance"), 1);
}

#[tokio::test]
async fn test_metadata_only_change_skips_remote_update() {
    let env = Env::new();
    env.ready_instance("db").await;
    env.fake.clear_calls();
    env.instances.edit(NAMESPACE, "db", true, |i| {
        i.metadata.labels = Some([("team".to_string(), "orders".to_string())].into());
    });

    env.reconcile_instance("db").await.unwrap();

    let instance = env.instance("db");
    assert_eq!(instance.status.as_ref().unwrap().observed_generation, 2);
    assert!(env.fake.calls().is_empty());
}

#[tokio::test]
async fn test_sharing_follows_spec() {
    let env = Env::new();
    env.ready_instance("db").await;
    env.instances.edit(NAMESPACE, "db", true, |i| {
        i.spec.shared = Some(true);
    });

    env.reconcile_instance("db").await.unwrap();

    let instance = env.instance("db");
    assert!(conditions::is_true(instance.conditions(), conditions::SHARED));
    assert_eq!(env.fake.instance("instance-1").unwrap().shared, Some(true));
}

#[tokio::test]
async fn test_rejected_share_waits_for_spec_change() {
    let env = Env::new();
    env.ready_instance("db").await;
    env.fake
        .fail_next("share_instance", SmError::api(400, "sharing not supported for plan"));
    env.instances.edit(NAMESPACE, "db", true, |i| {
        i.spec.shared = Some(true);
    });

    for _ in 0..3 {
        env.reconcile_instance("db").await.unwrap();
    }

    let instance = env.instance("db");
    let shared = conditions::find(instance.conditions(), conditions::SHARED).unwrap();
    assert!(!shared.is_true());
    assert_eq!(shared.reason(), reasons::SHARE_FAILED);
    assert_eq!(env.fake.count("share_instance"), 1);

    env.instances.edit(NAMESPACE, "db", true, |_| {});
    env.reconcile_instance("db").await.unwrap();

    let instance = env.instance("db");
    assert!(conditions::is_true(instance.conditions(), conditions::SHARED));
    assert_eq!(env.fake.count("share_instance"), 2);
}

#[tokio::test]
async fn test_unreadable_operation_status_drops_operation_and_keeps_id() {
    let env = Env::new();
    env.add_instance("db");
    env.reconcile_instance("db").await.unwrap();
    env.fake.accept_next("provision", "op-1");
    env.reconcile_instance("db").await.unwrap();
    env.fake
        .fail_next("status", SmError::api(503, "service manager unavailable"));

    let result = env.reconcile_instance("db").await;
    assert!(matches!(result, Err(ReconcilerError::Transient { .. })));

    let instance = env.instance("db");
    let status = instance.status.clone().unwrap();
    assert!(status.operation_url.is_none());
    assert_eq!(status.instance_id.as_deref(), Some("instance-1"));
    assert_eq!(succeeded_reason(&instance), reasons::CREATE_IN_PROGRESS);
    assert!(!conditions::is_true(instance.conditions(), conditions::FAILED));
    assert_eq!(env.fake.count("provision"), 1);
}

#[tokio::test]
async fn test_delete_deprovisions_and_releases_finalizer() {
    let env = Env::new();
    env.ready_instance("db").await;
    env.instances.delete(NAMESPACE, "db").await.unwrap();

    let action = env.reconcile_instance("db").await.unwrap();
    assert_eq!(action, Action::await_change());

    assert!(env.instances.get_now(NAMESPACE, "db").is_none());
    assert!(env.fake.instance("instance-1").is_none());
    assert_eq!(env.fake.count("deprovision"), 1);
}

#[tokio::test]
async fn test_delete_without_id_recovers_remote_instance_first() {
    let env = Env::new();
    env.add_instance("db");
    env.reconcile_instance("db").await.unwrap();
    env.fake.insert_instance(RemoteInstance {
        id: "orphan-1".to_string(),
        name: "db".to_string(),
        service_plan_id: "plan-mongo-small".to_string(),
        ready: true,
        shared: None,
        labels: env.correlation_labels("db"),
        last_operation: None,
    });
    env.instances.delete(NAMESPACE, "db").await.unwrap();

    env.reconcile_instance("db").await.unwrap();

    assert!(env.instances.get_now(NAMESPACE, "db").is_none());
    assert!(env.fake.instance("orphan-1").is_none());
    assert_eq!(env.fake.count("list_instances"), 1);
    assert_eq!(env.fake.count("deprovision"), 1);
}

#[tokio::test]
async fn test_accepted_deprovision_keeps_finalizer_until_done() {
    let env = Env::new();
    env.ready_instance("db").await;
    env.fake.accept_next("deprovision", "op-del");
    env.instances.delete(NAMESPACE, "db").await.unwrap();

    let action = env.reconcile_instance("db").await.unwrap();
    assert_eq!(action, Action::requeue(env.ctx.config.poll_interval()));
    let instance = env.instance("db");
    assert_eq!(succeeded_reason(&instance), reasons::DELETE_IN_PROGRESS);

    env.fake.set_operation_state(
        "/v1/service_instances/instance-1/operations/op-del",
        OperationState::Succeeded,
    );
    env.reconcile_instance("db").await.unwrap();
    assert!(env.instances.get_now(NAMESPACE, "db").is_none());
}

#[tokio::test]
async fn test_failed_deprovision_keeps_resource() {
    let env = Env::new();
    env.ready_instance("db").await;
    env.fake.fail_next("deprovision", SmError::api(400, "instance has bindings"));
    env.instances.delete(NAMESPACE, "db").await.unwrap();

    let err = env.reconcile_instance("db").await.unwrap_err();
    assert!(matches!(err, ReconcilerError::DeleteFailed(_)));
    let instance = env.instance("db");
    assert_eq!(succeeded_reason(&instance), reasons::DELETE_FAILED);
    assert!(instance.metadata.finalizers.is_some_and(|f| !f.is_empty()));
}
