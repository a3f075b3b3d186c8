//! Desired-state builder
//!
//! Pure functions from a [`Sleuth`] spec to the full set of [`Descriptor`]s
//! that realize it: ServiceAccount, Service, ClusterRole, ClusterRoleBinding
//! and the Deployment running the diagnostics server. The builder performs no
//! I/O and is deterministic; a spec maps to the same descriptor set every
//! time, which is what lets the synchronizer re-run a pass at any point.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, PodSpec, PodTemplateSpec,
    ResourceRequirements, SecretKeySelector, SecretVolumeSource, Service, ServiceAccount,
    ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};
use serde::Serialize;

use crate::crd::{RemoteCacheProvider, Sleuth};
use crate::sync::{Descriptor, DescriptorKind, ObjectKey};
use crate::Error;

/// Annotation key for IAM role federation on the workload ServiceAccount
const IRSA_ANNOTATION: &str = "eks.amazonaws.com/role-arn";

/// Mount point for the workload's writable scratch volume
const DATA_MOUNT_PATH: &str = "/sleuth-data";

/// Name of the emptyDir scratch volume
const DATA_VOLUME_NAME: &str = "sleuth-data";

/// Derived object names for one Sleuth instance
///
/// The ServiceAccount is shared per namespace; the Service and Deployment
/// follow the instance name.
struct Names {
    namespace: String,
    instance: String,
    service_account: String,
    cluster_role: String,
    cluster_role_binding: String,
}

impl Names {
    fn for_sleuth(sleuth: &Sleuth) -> Self {
        let namespace = sleuth.namespace().unwrap_or_else(|| "default".to_string());
        let instance = sleuth.name_any();
        let service_account = format!("sleuth-{namespace}");
        let cluster_role = format!("{service_account}-clusterrole");
        let cluster_role_binding = format!("{cluster_role}-binding");
        Self {
            namespace,
            instance,
            service_account,
            cluster_role,
            cluster_role_binding,
        }
    }
}

/// Build the ordered descriptor set for a Sleuth instance
///
/// Order is identity before workload: ServiceAccount, Service, ClusterRole,
/// ClusterRoleBinding, Deployment. The binding is omitted in out-of-cluster
/// mode unless the backend's identity federation still needs the in-cluster
/// ServiceAccount.
pub fn descriptors(sleuth: &Sleuth) -> Result<Vec<Descriptor>, Error> {
    let names = Names::for_sleuth(sleuth);
    let bind_identity = !sleuth.spec.is_out_of_cluster() || sleuth.spec.keeps_identity_out_of_cluster();

    let mut set = vec![
        to_descriptor(
            ObjectKey::namespaced(
                DescriptorKind::ServiceAccount,
                &names.namespace,
                &names.service_account,
            ),
            &service_account(sleuth, &names),
        )?,
        to_descriptor(
            ObjectKey::namespaced(DescriptorKind::Service, &names.namespace, &names.instance),
            &service(sleuth, &names),
        )?,
        to_descriptor(
            ObjectKey::cluster_scoped(DescriptorKind::ClusterRole, &names.cluster_role),
            &cluster_role(&names),
        )?,
    ];

    if bind_identity {
        set.push(to_descriptor(
            ObjectKey::cluster_scoped(
                DescriptorKind::ClusterRoleBinding,
                &names.cluster_role_binding,
            ),
            &cluster_role_binding(&names),
        )?);
    }

    set.push(to_descriptor(
        ObjectKey::namespaced(DescriptorKind::Deployment, &names.namespace, &names.instance),
        &deployment(sleuth, &names),
    )?);

    Ok(set)
}

/// Identity keys of every object a Sleuth instance may own
///
/// Metadata-only: usable during teardown even when the spec no longer passes
/// validation. Always includes the ClusterRoleBinding since an earlier spec
/// revision may have created it.
pub fn descriptor_keys(sleuth: &Sleuth) -> Vec<ObjectKey> {
    let names = Names::for_sleuth(sleuth);
    vec![
        ObjectKey::namespaced(DescriptorKind::Deployment, &names.namespace, &names.instance),
        ObjectKey::namespaced(DescriptorKind::Service, &names.namespace, &names.instance),
        ObjectKey::cluster_scoped(
            DescriptorKind::ClusterRoleBinding,
            &names.cluster_role_binding,
        ),
        ObjectKey::cluster_scoped(DescriptorKind::ClusterRole, &names.cluster_role),
        ObjectKey::namespaced(
            DescriptorKind::ServiceAccount,
            &names.namespace,
            &names.service_account,
        ),
    ]
}

fn to_descriptor<T: Serialize>(key: ObjectKey, object: &T) -> Result<Descriptor, Error> {
    let payload = serde_json::to_value(object)
        .map_err(|e| Error::serialization(format!("failed to serialize {key}: {e}")))?;
    Ok(Descriptor::new(key, payload))
}

fn labels(names: &Names) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), names.instance.clone())])
}

fn owner_reference(sleuth: &Sleuth) -> Vec<OwnerReference> {
    // Cluster-scoped objects cannot carry a namespaced owner, so only the
    // namespaced builders attach this.
    match sleuth.controller_owner_ref(&()) {
        Some(owner) => vec![owner],
        None => Vec::new(),
    }
}

fn namespaced_meta(sleuth: &Sleuth, names: &Names, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(names.namespace.clone()),
        labels: Some(labels(names)),
        owner_references: Some(owner_reference(sleuth)),
        ..Default::default()
    }
}

fn service_account(sleuth: &Sleuth, names: &Names) -> ServiceAccount {
    let mut meta = namespaced_meta(sleuth, names, &names.service_account);
    if let Some(role_arn) = sleuth.spec.irsa_role_arn() {
        meta.annotations = Some(BTreeMap::from([(
            IRSA_ANNOTATION.to_string(),
            role_arn.to_string(),
        )]));
    }
    ServiceAccount {
        metadata: meta,
        ..Default::default()
    }
}

fn service(sleuth: &Sleuth, names: &Names) -> Service {
    Service {
        metadata: namespaced_meta(sleuth, names, &names.instance),
        spec: Some(ServiceSpec {
            selector: Some(labels(names)),
            ports: Some(vec![ServicePort {
                name: Some("grpc".to_string()),
                port: crate::WORKLOAD_PORT,
                target_port: Some(IntOrString::Int(crate::WORKLOAD_PORT)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn cluster_role(names: &Names) -> ClusterRole {
    ClusterRole {
        metadata: ObjectMeta {
            name: Some(names.cluster_role.clone()),
            labels: Some(labels(names)),
            ..Default::default()
        },
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec!["*".to_string()]),
            resources: Some(vec!["*".to_string()]),
            verbs: vec!["get".to_string(), "list".to_string(), "watch".to_string()],
            ..Default::default()
        }]),
        ..Default::default()
    }
}

fn cluster_role_binding(names: &Names) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(names.cluster_role_binding.clone()),
            labels: Some(labels(names)),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: names.cluster_role.clone(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: names.service_account.clone(),
            namespace: Some(names.namespace.clone()),
            ..Default::default()
        }]),
    }
}

fn deployment(sleuth: &Sleuth, names: &Names) -> Deployment {
    let spec = &sleuth.spec;
    let detached_identity =
        spec.is_out_of_cluster() && !spec.keeps_identity_out_of_cluster();

    let mut args = vec!["serve".to_string()];
    let mut volumes = vec![Volume {
        name: DATA_VOLUME_NAME.to_string(),
        empty_dir: Some(Default::default()),
        ..Default::default()
    }];
    let mut mounts = vec![VolumeMount {
        name: DATA_VOLUME_NAME.to_string(),
        mount_path: DATA_MOUNT_PATH.to_string(),
        ..Default::default()
    }];

    if let Some(kubeconfig) = &spec.kubeconfig {
        let mount_path = format!("/tmp/{}", names.instance);
        args.push(format!("--kubeconfig={}/{}", mount_path, kubeconfig.key));
        volumes.push(Volume {
            name: "kubeconfig".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(kubeconfig.name.clone()),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: "kubeconfig".to_string(),
            mount_path,
            read_only: Some(true),
            ..Default::default()
        });
    }

    let mut pod_spec = PodSpec {
        service_account_name: Some(names.service_account.clone()),
        containers: vec![Container {
            name: "sleuth".to_string(),
            image: Some(format!("{}:{}", spec.repository, spec.version)),
            image_pull_policy: spec.image_pull_policy.clone(),
            args: Some(args),
            ports: Some(vec![ContainerPort {
                container_port: crate::WORKLOAD_PORT,
                ..Default::default()
            }]),
            env: Some(env_vars(sleuth)),
            volume_mounts: Some(mounts),
            resources: Some(resources(sleuth)),
            ..Default::default()
        }],
        volumes: Some(volumes),
        node_selector: spec.node_selector.clone(),
        ..Default::default()
    };

    if detached_identity {
        // The workload analyzes an external cluster: it must not use (or
        // even mount) the in-cluster identity.
        pod_spec.service_account_name = None;
        pod_spec.automount_service_account_token = Some(false);
    }

    Deployment {
        metadata: namespaced_meta(sleuth, names, &names.instance),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels(names)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels(names)),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Environment for the diagnostics server container
///
/// Order is fixed so repeated builds are byte-identical: core settings,
/// optional tuning, credentials, backend extras, remote cache.
fn env_vars(sleuth: &Sleuth) -> Vec<EnvVar> {
    let ai = &sleuth.spec.ai;
    let mut env = vec![
        plain_env("SLEUTH_MODEL", &ai.model),
        plain_env("SLEUTH_BACKEND", ai.backend.to_string()),
        plain_env("XDG_CONFIG_HOME", format!("{DATA_MOUNT_PATH}/.config")),
        plain_env("XDG_CACHE_HOME", format!("{DATA_MOUNT_PATH}/.cache")),
    ];

    if let Some(max_tokens) = &ai.max_tokens {
        env.push(plain_env("SLEUTH_MAX_TOKENS", max_tokens));
    }
    if let Some(top_k) = &ai.top_k {
        env.push(plain_env("SLEUTH_TOP_K", top_k));
    }

    if let Some(secret) = &ai.secret {
        if ai.backend.has_dedicated_credentials() {
            // Bedrock consumes AWS credential variables, never the generic
            // password injection.
            env.push(secret_env("AWS_ACCESS_KEY_ID", &secret.name, "AWS_ACCESS_KEY_ID"));
            env.push(secret_env(
                "AWS_SECRET_ACCESS_KEY",
                &secret.name,
                "AWS_SECRET_ACCESS_KEY",
            ));
        } else {
            env.push(secret_env("SLEUTH_PASSWORD", &secret.name, &secret.key));
        }
    }

    if ai.backend.requires_region() {
        if let Some(region) = &ai.region {
            env.push(plain_env("AWS_DEFAULT_REGION", region));
        }
    }

    if let Some(engine) = &ai.engine {
        env.push(plain_env("SLEUTH_ENGINE", engine));
    }
    if let Some(base_url) = &ai.base_url {
        env.push(plain_env("SLEUTH_BASEURL", base_url));
    }
    if let Some(provider_id) = &ai.provider_id {
        env.push(plain_env("SLEUTH_PROVIDER_ID", provider_id));
    }
    if let Some(proxy) = &ai.proxy_endpoint {
        env.push(plain_env("SLEUTH_PROXY_ENDPOINT", proxy));
    }

    if let Some(cache) = &sleuth.spec.remote_cache {
        let creds = &cache.credentials.name;
        match cache.provider {
            RemoteCacheProvider::Azure => {
                env.push(secret_env("AZURE_CLIENT_ID", creds, "AZURE_CLIENT_ID"));
                env.push(secret_env("AZURE_TENANT_ID", creds, "AZURE_TENANT_ID"));
                env.push(secret_env("AZURE_CLIENT_SECRET", creds, "AZURE_CLIENT_SECRET"));
            }
            RemoteCacheProvider::S3 => {
                env.push(secret_env("AWS_ACCESS_KEY_ID", creds, "AWS_ACCESS_KEY_ID"));
                env.push(secret_env(
                    "AWS_SECRET_ACCESS_KEY",
                    creds,
                    "AWS_SECRET_ACCESS_KEY",
                ));
            }
        }
    }

    env
}

fn plain_env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn secret_env(name: &str, secret_name: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret_name.to_string(),
                key: key.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn resources(sleuth: &Sleuth) -> ResourceRequirements {
    let spec = sleuth.spec.resources.as_ref();
    ResourceRequirements {
        limits: Some(BTreeMap::from([
            (
                "cpu".to_string(),
                default_or(spec.and_then(|r| r.cpu_limit.as_ref()), crate::DEFAULT_CPU_LIMIT),
            ),
            (
                "memory".to_string(),
                default_or(
                    spec.and_then(|r| r.memory_limit.as_ref()),
                    crate::DEFAULT_MEMORY_LIMIT,
                ),
            ),
        ])),
        requests: Some(BTreeMap::from([
            (
                "cpu".to_string(),
                default_or(
                    spec.and_then(|r| r.cpu_request.as_ref()),
                    crate::DEFAULT_CPU_REQUEST,
                ),
            ),
            (
                "memory".to_string(),
                default_or(
                    spec.and_then(|r| r.memory_request.as_ref()),
                    crate::DEFAULT_MEMORY_REQUEST,
                ),
            ),
        ])),
        ..Default::default()
    }
}

/// Per-field resource fallback: an explicit value wins, otherwise the fixed
/// default; the other fields are never consulted
fn default_or(explicit: Option<&String>, fallback: &str) -> Quantity {
    Quantity(explicit.cloned().unwrap_or_else(|| fallback.to_string()))
}
