//! kube-rs 기반 ClusterClient

use std::collections::BTreeMap;
use std::fmt::Debug;

use anyhow::anyhow;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{
    ConfigMap, Namespace, PersistentVolumeClaim, Secret, Service,
};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;

use super::{
    ClusterClient, DbInstanceResource, DbInstanceStatus, Workload, WorkloadKind, FIELD_MANAGER,
    LABEL_MANAGED_BY, LABEL_USER_ID, MANAGED_BY,
};
use crate::config::ClusterConfig;
use crate::error::{ApiError, ApiResult};

#[derive(Clone)]
pub struct KubeClient {
    client: Client,
}

impl KubeClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// kubeconfig 경로 > in-cluster > 기본 추론 순
    pub async fn connect(config: &ClusterConfig) -> anyhow::Result<Self> {
        let client = if let Some(path) = &config.kubeconfig {
            let kubeconfig = Kubeconfig::read_from(path)?;
            let options = KubeConfigOptions::default();
            Client::try_from(kube::Config::from_custom_kubeconfig(kubeconfig, &options).await?)?
        } else if config.in_cluster {
            Client::try_from(kube::Config::incluster()?)?
        } else {
            Client::try_default().await?
        };

        Ok(Self::new(client))
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn apply_object<K>(&self, object: &K) -> ApiResult<()>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Serialize + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let meta = object.meta();
        let (Some(namespace), Some(name)) = (meta.namespace.as_deref(), meta.name.as_deref()) else {
            return Err(ApiError::internal(anyhow!("object without namespace or name")));
        };

        let api: Api<K> = self.namespaced(namespace);
        api.patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(object))
            .await?;
        Ok(())
    }

    async fn delete_object<K>(&self, namespace: &str, name: &str) -> ApiResult<()>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = self.namespaced(namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)?;
        Ok(())
    }
}

fn ignore_not_found<T>(result: Result<T, kube::Error>) -> ApiResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[async_trait]
impl ClusterClient for KubeClient {
    async fn create_db_instance(&self, resource: &DbInstanceResource) -> ApiResult<()> {
        let namespace = resource.user_namespace();
        let api: Api<DbInstanceResource> = self.namespaced(&namespace);

        match api.create(&PostParams::default(), resource).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 409 => Err(ApiError::Conflict {
                resource: "DBInstance".into(),
                detail: resource.instance_name(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_db_instance(&self, namespace: &str, name: &str) -> ApiResult<Option<DbInstanceResource>> {
        let api: Api<DbInstanceResource> = self.namespaced(namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn delete_db_instance(&self, namespace: &str, name: &str) -> ApiResult<()> {
        self.delete_object::<DbInstanceResource>(namespace, name).await
    }

    async fn patch_db_instance_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DbInstanceStatus,
    ) -> ApiResult<()> {
        let api: Api<DbInstanceResource> = self.namespaced(namespace);
        let patch = json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn set_finalizers(&self, namespace: &str, name: &str, finalizers: &[String]) -> ApiResult<()> {
        let api: Api<DbInstanceResource> = self.namespaced(namespace);
        let patch = json!({ "metadata": { "finalizers": finalizers } });
        ignore_not_found(
            api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await,
        )?;
        Ok(())
    }

    async fn ensure_namespace(&self, name: &str, user_id: &str) -> ApiResult<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(BTreeMap::from([
                    (LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
                    (LABEL_USER_ID.to_string(), user_id.to_string()),
                ])),
                ..Default::default()
            },
            ..Default::default()
        };

        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Apply(&namespace))
            .await?;
        Ok(())
    }

    async fn apply(&self, workload: &Workload) -> ApiResult<()> {
        match workload {
            Workload::Secret(o) => self.apply_object(o).await,
            Workload::ConfigMap(o) => self.apply_object(o).await,
            Workload::Service(o) => self.apply_object(o).await,
            Workload::StatefulSet(o) => self.apply_object(o).await,
            Workload::NetworkPolicy(o) => self.apply_object(o).await,
            Workload::CronJob(o) => self.apply_object(o).await,
            Workload::PersistentVolumeClaim(o) => self.apply_object(o).await,
            Workload::Job(o) => self.apply_object(o).await,
        }
    }

    async fn delete(&self, kind: WorkloadKind, namespace: &str, name: &str) -> ApiResult<()> {
        match kind {
            WorkloadKind::Secret => self.delete_object::<Secret>(namespace, name).await,
            WorkloadKind::ConfigMap => self.delete_object::<ConfigMap>(namespace, name).await,
            WorkloadKind::Service => self.delete_object::<Service>(namespace, name).await,
            WorkloadKind::StatefulSet => self.delete_object::<StatefulSet>(namespace, name).await,
            WorkloadKind::NetworkPolicy => self.delete_object::<NetworkPolicy>(namespace, name).await,
            WorkloadKind::CronJob => self.delete_object::<CronJob>(namespace, name).await,
            WorkloadKind::PersistentVolumeClaim => {
                self.delete_object::<PersistentVolumeClaim>(namespace, name).await
            }
            WorkloadKind::Job => self.delete_object::<Job>(namespace, name).await,
        }
    }

    async fn delete_pvcs(&self, namespace: &str, selector: &str) -> ApiResult<usize> {
        let api: Api<PersistentVolumeClaim> = self.namespaced(namespace);
        let pvcs = api.list(&ListParams::default().labels(selector)).await?;

        let mut deleted = 0;
        for pvc in pvcs.items {
            if let Some(name) = pvc.metadata.name.as_deref() {
                if ignore_not_found(api.delete(name, &DeleteParams::default()).await)?.is_some() {
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> ApiResult<Option<Secret>> {
        let api: Api<Secret> = self.namespaced(namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_stateful_set(&self, namespace: &str, name: &str) -> ApiResult<Option<StatefulSet>> {
        let api: Api<StatefulSet> = self.namespaced(namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn scale_stateful_set(&self, namespace: &str, name: &str, replicas: i32) -> ApiResult<()> {
        let api: Api<StatefulSet> = self.namespaced(namespace);
        let patch = json!({ "spec": { "replicas": replicas } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_job(&self, namespace: &str, name: &str) -> ApiResult<Option<Job>> {
        let api: Api<Job> = self.namespaced(namespace);
        Ok(api.get_opt(name).await?)
    }
}
