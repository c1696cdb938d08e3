//! # Constants
//!
//! Shared constants used throughout the controller.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration or environment variables where applicable.

/// API group of both custom resources
pub const API_GROUP: &str = "services.operator.io";

/// Field manager used for every write the controller performs
pub const FIELD_MANAGER: &str = "service-manager-controller";

/// Finalizer guarding remote cleanup of instances and bindings
pub const FINALIZER: &str = "services.operator.io/finalizer";

/// Annotation that forces a credential rotation on the next reconcile
pub const FORCE_ROTATE_ANNOTATION: &str = "services.operator.io/forceRotate";

/// Label carried by a stale binding: the remote binding ID it holds
pub const STALE_BINDING_ID_LABEL: &str = "services.operator.io/stale-binding-id";

/// Label carried by a stale binding: the name of the binding it was rotated from
pub const STALE_BINDING_ROTATION_OF_LABEL: &str = "services.operator.io/stale-binding-rotation-of";

/// Annotation carried by a stale binding with the untruncated original name
pub const STALE_BINDING_ORIGINAL_NAME_ANNOTATION: &str =
    "services.operator.io/original-binding-name";

/// Label put on every materialized secret naming the binding it belongs to
pub const SECRET_BINDING_LABEL: &str = "services.operator.io/binding";

/// Remote label holding the local resource name
pub const REMOTE_K8S_NAME_LABEL: &str = "_k8sname";

/// Remote label holding the local namespace
pub const REMOTE_NAMESPACE_LABEL: &str = "_namespace";

/// Remote label holding the cluster identifier
pub const REMOTE_CLUSTER_ID_LABEL: &str = "_clusterid";

/// Key under which the secret metadata document is stored
pub const SECRET_METADATA_KEY: &str = ".metadata";

/// Upper bound on rendered secret template output (bytes)
pub const TEMPLATE_OUTPUT_MAX_BYTES: usize = 1024 * 1024;

/// Kubernetes label values are limited to 63 characters
pub const MAX_LABEL_VALUE_LEN: usize = 63;

/// Default HTTP server port for metrics and health probes
pub const DEFAULT_METRICS_PORT: u16 = 5000;

/// Default fixed requeue while a remote operation is pending (seconds)
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;

/// Default requeue while waiting on a dependency or a stale binding (seconds)
pub const DEFAULT_LONG_POLL_INTERVAL_SECS: u64 = 60;

/// Default exponential backoff starting value (seconds)
pub const DEFAULT_BACKOFF_START_SECS: u64 = 5;

/// Default exponential backoff maximum value (seconds)
pub const DEFAULT_BACKOFF_MAX_SECS: u64 = 1000;

/// Default number of re-read-and-retry attempts after a write conflict
pub const DEFAULT_CONFLICT_RETRIES: u32 = 3;

/// Default delay before restarting a watch stream that ended (seconds)
pub const DEFAULT_WATCH_RESTART_DELAY_SECS: u64 = 5;

/// Default well-known name of the remote credentials secret
pub const DEFAULT_CREDENTIALS_SECRET_NAME: &str = "service-manager-credentials";

/// Default namespace the controller is released into
pub const DEFAULT_RELEASE_NAMESPACE: &str = "service-manager-system";
