//! Shared fixtures for reconciler scenario tests.

#![allow(dead_code)]

use kube::runtime::controller::Action;
use service_manager_controller::config::ControllerConfig;
use service_manager_controller::constants::{
    REMOTE_CLUSTER_ID_LABEL, REMOTE_K8S_NAME_LABEL, REMOTE_NAMESPACE_LABEL,
};
use service_manager_controller::controller::conditions::{self, Conditioned};
use service_manager_controller::controller::reconciler::{reconcile, Reconciler, ReconcilerError};
use service_manager_controller::crd::{
    ServiceBinding, ServiceBindingSpec, ServiceInstance, ServiceInstanceSpec,
};
use service_manager_controller::sm::Labels;
use service_manager_controller::testing::{FakeServiceManager, MemoryStore, StaticClientFactory};
use k8s_openapi::api::core::v1::Secret;
use std::sync::Arc;

pub const NAMESPACE: &str = "shop";
pub const CLUSTER_ID: &str = "cluster-a";

/// A reconciler wired to in-memory stores and a fake service manager
pub struct Env {
    pub fake: Arc<FakeServiceManager>,
    pub instances: Arc<MemoryStore<ServiceInstance>>,
    pub bindings: Arc<MemoryStore<ServiceBinding>>,
    pub secrets: Arc<MemoryStore<Secret>>,
    pub ctx: Arc<Reconciler>,
}

impl Env {
    pub fn new() -> Self {
        let config = ControllerConfig {
            cluster_id: CLUSTER_ID.to_string(),
            ..ControllerConfig::default()
        };
        Self::with_config(config)
    }

    pub fn with_config(config: ControllerConfig) -> Self {
        let fake = Arc::new(FakeServiceManager::new());
        let instances = Arc::new(MemoryStore::<ServiceInstance>::new());
        let bindings = Arc::new(MemoryStore::<ServiceBinding>::new());
        let secrets = Arc::new(MemoryStore::<Secret>::new());
        let ctx = Arc::new(Reconciler::new(
            config,
            Arc::new(StaticClientFactory::new(Arc::<FakeServiceManager>::clone(&fake))),
            Arc::<MemoryStore<ServiceInstance>>::clone(&instances),
            Arc::<MemoryStore<ServiceBinding>>::clone(&bindings),
            Arc::<MemoryStore<Secret>>::clone(&secrets),
        ));
        Self {
            fake,
            instances,
            bindings,
            secrets,
            ctx,
        }
    }

    pub fn add_instance(&self, name: &str) -> ServiceInstance {
        let mut instance = ServiceInstance::new(
            name,
            ServiceInstanceSpec {
                service_offering_name: "mongo".to_string(),
                service_plan_name: "small".to_string(),
                ..Default::default()
            },
        );
        instance.metadata.namespace = Some(NAMESPACE.to_string());
        self.instances.insert(instance)
    }

    pub fn add_binding(&self, name: &str, spec: ServiceBindingSpec) -> ServiceBinding {
        let mut binding = ServiceBinding::new(name, spec);
        binding.metadata.namespace = Some(NAMESPACE.to_string());
        self.bindings.insert(binding)
    }

    pub fn instance(&self, name: &str) -> ServiceInstance {
        self.instances
            .get_now(NAMESPACE, name)
            .expect("instance exists")
    }

    pub fn binding(&self, name: &str) -> ServiceBinding {
        self.bindings
            .get_now(NAMESPACE, name)
            .expect("binding exists")
    }

    pub fn secret(&self, name: &str) -> Option<Secret> {
        self.secrets.get_now(NAMESPACE, name)
    }

    pub async fn reconcile_instance(&self, name: &str) -> Result<Action, ReconcilerError> {
        reconcile(Arc::new(self.instance(name)), Arc::clone(&self.ctx)).await
    }

    pub async fn reconcile_binding(&self, name: &str) -> Result<Action, ReconcilerError> {
        reconcile(Arc::new(self.binding(name)), Arc::clone(&self.ctx)).await
    }

    /// Create an instance and drive it to `Ready`
    pub async fn ready_instance(&self, name: &str) -> ServiceInstance {
        self.add_instance(name);
        self.reconcile_instance(name).await.expect("initialize");
        self.reconcile_instance(name).await.expect("provision");
        let instance = self.instance(name);
        assert!(instance.is_ready());
        instance
    }

    /// Remote labels the controller puts on objects it creates
    pub fn correlation_labels(&self, name: &str) -> Labels {
        Labels::from([
            (REMOTE_CLUSTER_ID_LABEL.to_string(), vec![CLUSTER_ID.to_string()]),
            (REMOTE_NAMESPACE_LABEL.to_string(), vec![NAMESPACE.to_string()]),
            (REMOTE_K8S_NAME_LABEL.to_string(), vec![name.to_string()]),
        ])
    }
}

pub fn binding_spec(instance: &str) -> ServiceBindingSpec {
    ServiceBindingSpec {
        service_instance_name: instance.to_string(),
        ..Default::default()
    }
}

/// Reason of the `Succeeded` condition
pub fn succeeded_reason<C: Conditioned>(obj: &C) -> String {
    conditions::find(obj.conditions(), conditions::SUCCEEDED)
        .map(|c| c.reason().to_string())
        .unwrap_or_default()
}

pub fn is_ready<C: Conditioned>(obj: &C) -> bool {
    conditions::is_true(obj.conditions(), conditions::READY)
}

pub fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()?
        .get(key)
        .map(|v| String::from_utf8_lossy(&v.0).into_owned())
}
