//! 테스트용 인메모리 클러스터

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Mutex;

use anyhow::anyhow;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Secret;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use super::{ClusterClient, DbInstanceResource, DbInstanceStatus, Workload, WorkloadKind};
use crate::error::{ApiError, ApiResult};

type ObjectKey = (WorkloadKind, String, String);

#[derive(Default)]
pub struct FakeState {
    pub namespaces: BTreeSet<String>,
    pub instances: BTreeMap<(String, String), DbInstanceResource>,
    pub objects: BTreeMap<ObjectKey, Value>,
    /// 내용이 실제로 바뀐 쓰기 횟수
    pub writes: usize,
    /// 이 이름을 대상으로 하는 쓰기는 실패
    pub fail_names: HashSet<String>,
    next_uid: u64,
}

#[derive(Default)]
pub struct FakeCluster {
    pub state: Mutex<FakeState>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, name: &str) {
        self.state.lock().unwrap().fail_names.insert(name.to_string());
    }

    pub fn writes(&self) -> usize {
        self.state.lock().unwrap().writes
    }

    pub fn object(&self, kind: WorkloadKind, namespace: &str, name: &str) -> Option<Value> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn typed<K: DeserializeOwned>(&self, kind: WorkloadKind, namespace: &str, name: &str) -> Option<K> {
        self.object(kind, namespace, name)
            .map(|v| serde_json::from_value(v).unwrap())
    }

    pub fn names_of(&self, kind: WorkloadKind) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .objects
            .keys()
            .filter(|(k, _, _)| *k == kind)
            .map(|(_, _, name)| name.clone())
            .collect()
    }

    pub fn instance(&self, namespace: &str, name: &str) -> Option<DbInstanceResource> {
        self.state
            .lock()
            .unwrap()
            .instances
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// 컨트롤러 매니저 흉내: readyReplicas = spec.replicas
    pub fn mark_ready(&self, namespace: &str, name: &str) {
        self.set_ready_replicas(namespace, name, None);
    }

    pub fn set_ready_replicas(&self, namespace: &str, name: &str, ready: Option<i32>) {
        let mut state = self.state.lock().unwrap();
        let key = (WorkloadKind::StatefulSet, namespace.to_string(), name.to_string());
        if let Some(sts) = state.objects.get_mut(&key) {
            let replicas = sts["spec"]["replicas"].as_i64().unwrap_or(1);
            let ready = ready.map(i64::from).unwrap_or(replicas);
            sts["status"] = json!({ "replicas": replicas, "readyReplicas": ready });
        }
    }

    /// API 서버 삭제 요청 흉내 (finalizer 가 있으면 timestamp 만 설정)
    pub fn request_deletion(&self, namespace: &str, name: &str) {
        let mut state = self.state.lock().unwrap();
        let key = (namespace.to_string(), name.to_string());
        let remove = match state.instances.get_mut(&key) {
            Some(cr) if !cr.metadata.finalizers.as_deref().unwrap_or_default().is_empty() => {
                cr.metadata.deletion_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                    chrono::Utc::now(),
                ));
                false
            }
            Some(_) => true,
            None => false,
        };
        if remove {
            state.instances.remove(&key);
        }
    }

    fn check(state: &FakeState, name: &str) -> ApiResult<()> {
        if state.fail_names.contains(name) {
            return Err(ApiError::internal(anyhow!("simulated cluster failure: {}", name)));
        }
        Ok(())
    }

    fn get<K: DeserializeOwned>(&self, kind: WorkloadKind, namespace: &str, name: &str) -> ApiResult<Option<K>> {
        match self.object(kind, namespace, name) {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }
}

fn workload_value(workload: &Workload) -> ApiResult<Value> {
    let value = match workload {
        Workload::Secret(o) => serde_json::to_value(o)?,
        Workload::ConfigMap(o) => serde_json::to_value(o)?,
        Workload::Service(o) => serde_json::to_value(o)?,
        Workload::StatefulSet(o) => serde_json::to_value(o)?,
        Workload::NetworkPolicy(o) => serde_json::to_value(o)?,
        Workload::CronJob(o) => serde_json::to_value(o)?,
        Workload::PersistentVolumeClaim(o) => serde_json::to_value(o)?,
        Workload::Job(o) => serde_json::to_value(o)?,
    };
    Ok(value)
}

/// JSON merge patch (null 은 삭제)
fn merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                if value.is_null() {
                    target.remove(key);
                } else {
                    merge(target.entry(key.clone()).or_insert(Value::Null), value);
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn create_db_instance(&self, resource: &DbInstanceResource) -> ApiResult<()> {
        let mut state = self.state.lock().unwrap();
        let name = resource.instance_name();
        Self::check(&state, &name)?;

        let key = (resource.user_namespace(), name.clone());
        if state.instances.contains_key(&key) {
            return Err(ApiError::Conflict {
                resource: "DBInstance".into(),
                detail: name,
            });
        }

        state.next_uid += 1;
        let mut stored = resource.clone();
        stored.metadata.uid = Some(format!("uid-{}", state.next_uid));
        stored.metadata.namespace = Some(key.0.clone());
        stored.metadata.generation = Some(1);
        state.instances.insert(key, stored);
        state.writes += 1;
        Ok(())
    }

    async fn get_db_instance(&self, namespace: &str, name: &str) -> ApiResult<Option<DbInstanceResource>> {
        Ok(self.instance(namespace, name))
    }

    async fn delete_db_instance(&self, namespace: &str, name: &str) -> ApiResult<()> {
        {
            let state = self.state.lock().unwrap();
            Self::check(&state, name)?;
        }
        self.request_deletion(namespace, name);
        Ok(())
    }

    async fn patch_db_instance_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DbInstanceStatus,
    ) -> ApiResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, name)?;
        let key = (namespace.to_string(), name.to_string());
        let Some(cr) = state.instances.get_mut(&key) else {
            return Err(ApiError::not_found("DBInstance", name));
        };

        let mut current = serde_json::to_value(cr.current_status())?;
        merge(&mut current, &serde_json::to_value(status)?);
        let next: DbInstanceStatus = serde_json::from_value(current)?;

        if cr.status.as_ref() != Some(&next) {
            cr.status = Some(next);
            state.writes += 1;
        }
        Ok(())
    }

    async fn set_finalizers(&self, namespace: &str, name: &str, finalizers: &[String]) -> ApiResult<()> {
        let mut state = self.state.lock().unwrap();
        let key = (namespace.to_string(), name.to_string());
        let Some(cr) = state.instances.get_mut(&key) else {
            return Ok(());
        };

        cr.metadata.finalizers = Some(finalizers.to_vec());
        // 삭제 중이고 finalizer 가 모두 빠지면 실제로 사라짐
        if finalizers.is_empty() && cr.metadata.deletion_timestamp.is_some() {
            state.instances.remove(&key);
        }
        state.writes += 1;
        Ok(())
    }

    async fn ensure_namespace(&self, name: &str, _user_id: &str) -> ApiResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, name)?;
        if state.namespaces.insert(name.to_string()) {
            state.writes += 1;
        }
        Ok(())
    }

    async fn apply(&self, workload: &Workload) -> ApiResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, workload.name())?;

        let key = (
            workload.kind(),
            workload.namespace().to_string(),
            workload.name().to_string(),
        );
        let mut value = workload_value(workload)?;

        // status 는 서버 소유
        if let Some(existing) = state.objects.get(&key) {
            if let Some(status) = existing.get("status") {
                value["status"] = status.clone();
            }
        }

        if state.objects.get(&key) != Some(&value) {
            state.objects.insert(key, value);
            state.writes += 1;
        }
        Ok(())
    }

    async fn delete(&self, kind: WorkloadKind, namespace: &str, name: &str) -> ApiResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, name)?;
        if state
            .objects
            .remove(&(kind, namespace.to_string(), name.to_string()))
            .is_some()
        {
            state.writes += 1;
        }
        Ok(())
    }

    async fn delete_pvcs(&self, namespace: &str, selector: &str) -> ApiResult<usize> {
        let (label_key, label_value) = selector.split_once('=').unwrap_or((selector, ""));
        let mut state = self.state.lock().unwrap();

        let doomed: Vec<ObjectKey> = state
            .objects
            .iter()
            .filter(|((kind, ns, _), value)| {
                *kind == WorkloadKind::PersistentVolumeClaim
                    && ns == namespace
                    && value["metadata"]["labels"][label_key] == label_value
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in &doomed {
            state.objects.remove(key);
            state.writes += 1;
        }
        Ok(doomed.len())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> ApiResult<Option<Secret>> {
        self.get(WorkloadKind::Secret, namespace, name)
    }

    async fn get_stateful_set(&self, namespace: &str, name: &str) -> ApiResult<Option<StatefulSet>> {
        self.get(WorkloadKind::StatefulSet, namespace, name)
    }

    async fn scale_stateful_set(&self, namespace: &str, name: &str, replicas: i32) -> ApiResult<()> {
        let mut state = self.state.lock().unwrap();
        let key = (WorkloadKind::StatefulSet, namespace.to_string(), name.to_string());
        let Some(sts) = state.objects.get_mut(&key) else {
            return Err(ApiError::not_found("StatefulSet", name));
        };

        if sts["spec"]["replicas"] != json!(replicas) {
            sts["spec"]["replicas"] = json!(replicas);
            if replicas == 0 {
                sts["status"] = json!({ "replicas": 0, "readyReplicas": 0 });
            }
            state.writes += 1;
        }
        Ok(())
    }

    async fn get_job(&self, namespace: &str, name: &str) -> ApiResult<Option<Job>> {
        self.get(WorkloadKind::Job, namespace, name)
    }
}
