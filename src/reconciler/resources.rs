//! Workload builders
//!
//! 인스턴스 하나 = Secret + ConfigMap + Service + StatefulSet + NetworkPolicy
//! (+ 백업 PVC / CronJob). 모두 같은 입력이면 같은 객체를 만든다.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, Job, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, EnvFromSource, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec,
    ResourceRequirements, Secret, SecretEnvSource, Service, ServicePort, ServiceSpec, Volume,
    VolumeMount,
};
use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule, NetworkPolicyPeer,
    NetworkPolicyPort, NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Resource;
use rand::Rng;
use sha3::{Digest, Sha3_256};

use super::engine::{desired_replicas, plain_env, Engine};
use crate::error::ApiResult;
use crate::k8s::{
    names, DbInstanceResource, LABEL_INSTANCE, LABEL_INSTANCE_ID, LABEL_MANAGED_BY, LABEL_USER_ID,
    MANAGED_BY,
};
use crate::types::BackupConfig;

const PASSWORD_CHARSET: &[u8] =
    b"abcdefghijkmnopqrstuvwxyzABCDEFGHJKLMNPQRSTUVWXYZ123456789!@#$%^&*";
const PASSWORD_LENGTH: usize = 16;

/// 헷갈리는 문자(l, O, 0 등) 제외한 16자
pub fn generate_password() -> String {
    let mut rng = rand::thread_rng();
    (0..PASSWORD_LENGTH)
        .map(|_| PASSWORD_CHARSET[rng.gen_range(0..PASSWORD_CHARSET.len())] as char)
        .collect()
}

// ============ Labels / Metadata ============

/// Pod selector (불변 부분집합)
pub fn selector_labels(cr: &DbInstanceResource) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), cr.spec.db_type.as_str().to_string()),
        (LABEL_INSTANCE.to_string(), cr.instance_name()),
    ])
}

pub fn labels(cr: &DbInstanceResource) -> BTreeMap<String, String> {
    let mut labels = selector_labels(cr);
    labels.extend([
        ("app.kubernetes.io/component".to_string(), "database".to_string()),
        ("app.kubernetes.io/part-of".to_string(), "dbtree".to_string()),
        (LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
        (LABEL_USER_ID.to_string(), cr.spec.user_id.clone()),
        (LABEL_INSTANCE_ID.to_string(), cr.spec.external_id.clone()),
    ]);
    labels
}

fn backup_labels(cr: &DbInstanceResource) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), "backup".to_string()),
        (LABEL_INSTANCE.to_string(), cr.instance_name()),
        ("app.kubernetes.io/component".to_string(), "backup".to_string()),
        ("app.kubernetes.io/part-of".to_string(), "dbtree".to_string()),
        (LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
        (LABEL_INSTANCE_ID.to_string(), cr.spec.external_id.clone()),
    ])
}

/// uid 가 있으면(클러스터에 저장된 CR) owner reference 포함
fn object_meta(cr: &DbInstanceResource, name: String, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(cr.user_namespace()),
        labels: Some(labels),
        owner_references: cr.controller_owner_ref(&()).map(|owner| vec![owner]),
        ..Default::default()
    }
}

fn storage_request(size: String) -> ResourceRequirements {
    ResourceRequirements {
        requests: Some(BTreeMap::from([("storage".to_string(), Quantity(size))])),
        ..Default::default()
    }
}

// ============ Core workload ============

pub fn secret(cr: &DbInstanceResource, engine: &dyn Engine, password: &str) -> Secret {
    Secret {
        metadata: object_meta(cr, cr.secret_name(), labels(cr)),
        type_: Some("Opaque".to_string()),
        string_data: Some(engine.secret_data(cr.spec.db_type.username(), password)),
        ..Default::default()
    }
}

pub fn config_map(cr: &DbInstanceResource, engine: &dyn Engine) -> ApiResult<ConfigMap> {
    let rendered = engine.render_config(&cr.spec)?;
    Ok(ConfigMap {
        metadata: object_meta(cr, names::config_map(&cr.instance_name()), labels(cr)),
        data: Some(BTreeMap::from([(engine.config_file_name().to_string(), rendered)])),
        ..Default::default()
    })
}

/// 클러스터형 모드는 headless
pub fn service(cr: &DbInstanceResource, engine: &dyn Engine) -> Service {
    let port = engine.port();
    Service {
        metadata: object_meta(cr, names::service(&cr.instance_name()), labels(cr)),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            cluster_ip: cr.spec.mode.is_clustered().then(|| "None".to_string()),
            selector: Some(selector_labels(cr)),
            ports: Some(vec![ServicePort {
                name: Some(engine.name().to_string()),
                port,
                target_port: Some(IntOrString::Int(port)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// 외부 접속용 NodePort (`{name}-external`)
pub fn external_service(cr: &DbInstanceResource, engine: &dyn Engine, node_port: i32) -> Service {
    let port = engine.port();
    Service {
        metadata: object_meta(cr, names::external_service(&cr.instance_name()), labels(cr)),
        spec: Some(ServiceSpec {
            type_: Some("NodePort".to_string()),
            selector: Some(selector_labels(cr)),
            ports: Some(vec![ServicePort {
                name: Some(engine.name().to_string()),
                port,
                target_port: Some(IntOrString::Int(port)),
                node_port: Some(node_port),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn stateful_set(cr: &DbInstanceResource, engine: &dyn Engine) -> ApiResult<StatefulSet> {
    let name = cr.instance_name();
    let replicas = desired_replicas(&cr.spec)?;
    let container = engine.container(&cr.spec, &cr.secret_name())?;

    // 설정이 바뀌면 pod template 이 바뀌어 롤링 재시작
    let config_hash = hex::encode(Sha3_256::digest(engine.render_config(&cr.spec)?.as_bytes()));

    let volume_claim_templates = if engine.has_data_volume(&cr.spec)? {
        Some(vec![PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("data".to_string()),
                labels: Some(selector_labels(cr)),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                resources: Some(storage_request(format!("{}Gi", cr.spec.resources.disk))),
                ..Default::default()
            }),
            ..Default::default()
        }])
    } else {
        None
    };

    Ok(StatefulSet {
        metadata: object_meta(cr, names::stateful_set(&name), labels(cr)),
        spec: Some(StatefulSetSpec {
            service_name: names::service(&name),
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(selector_labels(cr)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels(cr)),
                    annotations: Some(BTreeMap::from([(
                        "dbtree.cloud/config-hash".to_string(),
                        config_hash[..16].to_string(),
                    )])),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(vec![Volume {
                        name: "config".to_string(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: Some(names::config_map(&name)),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            volume_claim_templates,
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// 같은 네임스페이스에서 DB 포트로만 접근, egress 는 DNS + 같은 네임스페이스
pub fn network_policy(cr: &DbInstanceResource, engine: &dyn Engine) -> NetworkPolicy {
    let port = |port: i32, protocol: &str| NetworkPolicyPort {
        port: Some(IntOrString::Int(port)),
        protocol: Some(protocol.to_string()),
        ..Default::default()
    };
    let same_namespace = || NetworkPolicyPeer {
        pod_selector: Some(LabelSelector::default()),
        ..Default::default()
    };

    NetworkPolicy {
        metadata: object_meta(cr, names::network_policy(&cr.instance_name()), labels(cr)),
        spec: Some(NetworkPolicySpec {
            pod_selector: LabelSelector {
                match_labels: Some(selector_labels(cr)),
                ..Default::default()
            },
            policy_types: Some(vec!["Ingress".to_string(), "Egress".to_string()]),
            ingress: Some(vec![NetworkPolicyIngressRule {
                from: Some(vec![same_namespace()]),
                ports: Some(vec![port(engine.port(), "TCP")]),
            }]),
            egress: Some(vec![
                NetworkPolicyEgressRule {
                    ports: Some(vec![port(53, "UDP"), port(53, "TCP")]),
                    to: None,
                },
                NetworkPolicyEgressRule {
                    ports: None,
                    to: Some(vec![same_namespace()]),
                },
            ]),
        }),
        ..Default::default()
    }
}

// ============ Backup ============

pub fn backup_pvc(cr: &DbInstanceResource) -> PersistentVolumeClaim {
    let size = cr
        .spec
        .backup
        .storage_size
        .clone()
        .unwrap_or_else(|| BackupConfig::DEFAULT_STORAGE_SIZE.to_string());

    PersistentVolumeClaim {
        metadata: object_meta(cr, names::backup_pvc(&cr.instance_name()), backup_labels(cr)),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(storage_request(size)),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn backup_volume(cr: &DbInstanceResource) -> Volume {
    Volume {
        name: "backup-storage".to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: names::backup_pvc(&cr.instance_name()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn backup_container(cr: &DbInstanceResource, engine: &dyn Engine, script: &str, backup_name: Option<&str>) -> Container {
    let retention = cr
        .spec
        .backup
        .retention_days
        .unwrap_or(BackupConfig::DEFAULT_RETENTION_DAYS);

    let mut env = vec![
        plain_env("DB_HOST", names::service(&cr.instance_name())),
        plain_env("DB_PORT", engine.port().to_string()),
        plain_env("BACKUP_RETENTION_DAYS", retention.to_string()),
    ];
    if let Some(backup_name) = backup_name {
        env.push(plain_env("BACKUP_NAME", backup_name));
    }

    Container {
        name: "backup".to_string(),
        image: Some(engine.backup_image().to_string()),
        command: Some(vec!["/bin/bash".to_string(), "-c".to_string(), script.to_string()]),
        env: Some(env),
        env_from: Some(vec![EnvFromSource {
            secret_ref: Some(SecretEnvSource {
                name: Some(cr.secret_name()),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        volume_mounts: Some(vec![VolumeMount {
            name: "backup-storage".to_string(),
            mount_path: "/backup".to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

/// 정기 백업 (`backup.enabled` 일 때만)
pub fn backup_cron_job(cr: &DbInstanceResource, engine: &dyn Engine) -> CronJob {
    let schedule = cr
        .spec
        .backup
        .schedule
        .clone()
        .unwrap_or_else(|| BackupConfig::DEFAULT_SCHEDULE.to_string());

    CronJob {
        metadata: object_meta(cr, names::backup_cron_job(&cr.instance_name()), backup_labels(cr)),
        spec: Some(CronJobSpec {
            schedule,
            concurrency_policy: Some("Forbid".to_string()),
            successful_jobs_history_limit: Some(3),
            failed_jobs_history_limit: Some(1),
            job_template: JobTemplateSpec {
                spec: Some(JobSpec {
                    template: PodTemplateSpec {
                        metadata: None,
                        spec: Some(PodSpec {
                            restart_policy: Some("OnFailure".to_string()),
                            containers: vec![backup_container(cr, engine, engine.backup_script(), None)],
                            volumes: Some(vec![backup_volume(cr)]),
                            ..Default::default()
                        }),
                    },
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn one_off_job(cr: &DbInstanceResource, job_name: &str, containers: Vec<Container>, volumes: Vec<Volume>) -> Job {
    Job {
        metadata: object_meta(cr, job_name.to_string(), backup_labels(cr)),
        spec: Some(JobSpec {
            backoff_limit: Some(1),
            ttl_seconds_after_finished: Some(7 * 24 * 3600),
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers,
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// 수동 백업 Job (아카이브 이름 = 백업 레코드 이름)
pub fn backup_job(cr: &DbInstanceResource, engine: &dyn Engine, job_name: &str, backup_name: &str) -> Job {
    one_off_job(
        cr,
        job_name,
        vec![backup_container(cr, engine, engine.backup_script(), Some(backup_name))],
        vec![backup_volume(cr)],
    )
}

/// 복원 Job
///
/// 데이터 볼륨이 필요한 엔진(Redis)은 ordinal 0 의 data PVC 도 마운트
pub fn restore_job(
    cr: &DbInstanceResource,
    engine: &dyn Engine,
    job_name: &str,
    backup_name: &str,
    mount_data: bool,
) -> Job {
    let mut container = backup_container(cr, engine, engine.restore_script(), Some(backup_name));
    container.name = "restore".to_string();
    let mut volumes = vec![backup_volume(cr)];

    if mount_data {
        if let Some(mounts) = container.volume_mounts.as_mut() {
            mounts.push(VolumeMount {
                name: "data".to_string(),
                mount_path: "/data".to_string(),
                ..Default::default()
            });
        }
        volumes.push(Volume {
            name: "data".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: names::data_pvc(&cr.instance_name(), 0),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    one_off_job(cr, job_name, vec![container], volumes)
}
