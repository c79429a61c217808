//! MongoDB 워크로드

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, ContainerPort, VolumeMount};

use super::engine::{
    exec_probe, plain_env, resource_requirements, secret_env, Engine, LIVENESS_TIMING,
    READINESS_TIMING,
};
use crate::error::{ApiError, ApiResult};
use crate::k8s::DbInstanceSpec;
use crate::types::{DbMode, EngineConfig, MongoConfig, MONGODB_PORT};

const REPLICA_SET_NAME: &str = "rs0";
const CONFIG_PATH: &str = "/etc/mongod/mongod.conf";

pub struct MongoEngine;

fn parse(spec: &DbInstanceSpec) -> ApiResult<MongoConfig> {
    match EngineConfig::parse(spec.db_type, &spec.config)? {
        EngineConfig::Mongo(config) => Ok(config),
        EngineConfig::Redis(_) => Err(ApiError::invalid_param("config", "not a mongodb config")),
    }
}

impl Engine for MongoEngine {
    fn name(&self) -> &'static str {
        "mongodb"
    }

    fn port(&self) -> i32 {
        MONGODB_PORT
    }

    fn config_file_name(&self) -> &'static str {
        "mongod.conf"
    }

    fn config_mount_path(&self) -> &'static str {
        "/etc/mongod"
    }

    fn render_config(&self, spec: &DbInstanceSpec) -> ApiResult<String> {
        let config = parse(spec)?;

        let mut conf = String::from(
            "# MongoDB configuration\n\
             systemLog:\n  verbosity: 0\n\
             storage:\n  dbPath: /data/db\n",
        );

        if let Some(cache) = config.wired_tiger_cache_size_gb {
            conf.push_str(&format!(
                "  wiredTiger:\n    engineConfig:\n      cacheSizeGB: {}\n",
                cache
            ));
        }

        conf.push_str(&format!("net:\n  port: {}\n  bindIp: 0.0.0.0\n", MONGODB_PORT));

        if spec.mode == DbMode::ReplicaSet {
            conf.push_str(&format!("replication:\n  replSetName: {}\n", REPLICA_SET_NAME));
        }

        Ok(conf)
    }

    fn container(&self, spec: &DbInstanceSpec, secret_name: &str) -> ApiResult<Container> {
        let config = parse(spec)?;

        // entrypoint 가 root 사용자 생성 후 `mongod --auth` 로 실행하므로 command 는 비워둠
        let mut args = vec!["--config".to_string(), CONFIG_PATH.to_string()];
        if spec.mode == DbMode::ReplicaSet {
            args.extend(["--replSet".to_string(), REPLICA_SET_NAME.to_string()]);
        }

        let ping = ["mongosh", "--quiet", "--eval", "db.adminCommand('ping')"];

        Ok(Container {
            name: self.name().to_string(),
            image: Some(format!("mongo:{}", config.version)),
            args: Some(args),
            ports: Some(vec![ContainerPort {
                name: Some(self.name().to_string()),
                container_port: MONGODB_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            env: Some(vec![
                secret_env("MONGO_INITDB_ROOT_USERNAME", secret_name, "MONGO_INITDB_ROOT_USERNAME"),
                secret_env("MONGO_INITDB_ROOT_PASSWORD", secret_name, "MONGO_INITDB_ROOT_PASSWORD"),
                plain_env("MONGO_INITDB_DATABASE", "admin"),
            ]),
            resources: Some(resource_requirements(&spec.resources)),
            volume_mounts: Some(vec![
                VolumeMount {
                    name: "data".to_string(),
                    mount_path: "/data/db".to_string(),
                    ..Default::default()
                },
                VolumeMount {
                    name: "config".to_string(),
                    mount_path: self.config_mount_path().to_string(),
                    ..Default::default()
                },
            ]),
            liveness_probe: Some(exec_probe(&ping, LIVENESS_TIMING)),
            readiness_probe: Some(exec_probe(&ping, READINESS_TIMING)),
            ..Default::default()
        })
    }

    fn has_data_volume(&self, _spec: &DbInstanceSpec) -> ApiResult<bool> {
        Ok(true)
    }

    fn secret_data(&self, username: &str, password: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("username".to_string(), username.to_string()),
            ("password".to_string(), password.to_string()),
            ("MONGO_INITDB_ROOT_USERNAME".to_string(), username.to_string()),
            ("MONGO_INITDB_ROOT_PASSWORD".to_string(), password.to_string()),
            ("MONGO_INITDB_DATABASE".to_string(), "admin".to_string()),
        ])
    }

    fn backup_image(&self) -> &'static str {
        "mongo:7.0"
    }

    fn backup_script(&self) -> &'static str {
        r#"set -e
NAME="${BACKUP_NAME:-mongodb-$(date +%Y%m%d_%H%M%S)}"
echo "starting mongodb backup ${NAME}"
mongodump \
  --host="${DB_HOST}" \
  --port="${DB_PORT}" \
  --username="${MONGO_INITDB_ROOT_USERNAME}" \
  --password="${MONGO_INITDB_ROOT_PASSWORD}" \
  --authenticationDatabase=admin \
  --out="/backup/${NAME}"
cd /backup
tar -czf "${NAME}.tar.gz" "${NAME}"
rm -rf "${NAME}"
echo "backup completed: ${NAME}.tar.gz"
find /backup -name "*.tar.gz" -mtime +"${BACKUP_RETENTION_DAYS}" -exec rm {} \;
"#
    }

    fn restore_script(&self) -> &'static str {
        r#"set -e
cd /backup
test -f "${BACKUP_NAME}.tar.gz"
rm -rf "/tmp/${BACKUP_NAME}"
tar -xzf "${BACKUP_NAME}.tar.gz" -C /tmp
mongorestore \
  --host="${DB_HOST}" \
  --port="${DB_PORT}" \
  --username="${MONGO_INITDB_ROOT_USERNAME}" \
  --password="${MONGO_INITDB_ROOT_PASSWORD}" \
  --authenticationDatabase=admin \
  --drop \
  "/tmp/${BACKUP_NAME}"
echo "restore completed: ${BACKUP_NAME}"
"#
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::SecretRef;
    use crate::types::{BackupConfig, DbSize, DbType, ResourceSpec};
    use serde_json::{json, Map, Value};

    fn spec(mode: DbMode, config: Value) -> DbInstanceSpec {
        let config: Map<String, Value> = serde_json::from_value(config).unwrap();
        DbInstanceSpec {
            name: "orders".into(),
            db_type: DbType::Mongodb,
            size: DbSize::Medium,
            mode,
            secret_ref: SecretRef { name: "orders-secret".into() },
            created_from_preset: None,
            resources: ResourceSpec { cpu: 2, memory: 4096, disk: 20 },
            backup: BackupConfig::default(),
            user_id: "u1".into(),
            config,
            external_id: "e1".into(),
        }
    }

    #[test]
    fn test_replica_set_config_and_args() {
        let spec = spec(DbMode::ReplicaSet, json!({ "version": "6.0", "wiredTigerCacheSizeGB": 1 }));

        let conf = MongoEngine.render_config(&spec).unwrap();
        assert!(conf.contains("replSetName: rs0"));
        assert!(conf.contains("cacheSizeGB: 1"));
        assert!(conf.contains("port: 27017"));

        let container = MongoEngine.container(&spec, "orders-secret").unwrap();
        assert_eq!(container.image.as_deref(), Some("mongo:6.0"));
        assert!(container.command.is_none());
        assert_eq!(
            container.args.unwrap(),
            vec!["--config", CONFIG_PATH, "--replSet", "rs0"]
        );

        let limits = container.resources.unwrap().limits.unwrap();
        assert_eq!(limits["cpu"].0, "2000m");
        assert_eq!(limits["memory"].0, "4096Mi");
    }

    #[test]
    fn test_standalone_has_no_replication_block() {
        let spec = spec(DbMode::Standalone, json!({}));
        let conf = MongoEngine.render_config(&spec).unwrap();
        assert!(!conf.contains("replication"));
        assert!(!conf.contains("wiredTiger"));

        let container = MongoEngine.container(&spec, "orders-secret").unwrap();
        assert_eq!(container.image.as_deref(), Some("mongo:7.0"));
        assert_eq!(container.args.unwrap(), vec!["--config", CONFIG_PATH]);
    }

    #[test]
    fn test_entrypoint_kept_for_root_user_init() {
        // 이미지 entrypoint 가 MONGO_INITDB_ROOT_* 로 사용자 생성 + --auth
        let spec = spec(DbMode::Standalone, json!({}));
        let container = MongoEngine.container(&spec, "orders-secret").unwrap();

        assert!(container.command.is_none());
        let env = container.env.unwrap();
        let user = env.iter().find(|e| e.name == "MONGO_INITDB_ROOT_USERNAME").unwrap();
        let key = &user.value_from.as_ref().unwrap().secret_key_ref.as_ref().unwrap();
        assert_eq!(key.name.as_deref(), Some("orders-secret"));
        assert!(env.iter().any(|e| e.name == "MONGO_INITDB_ROOT_PASSWORD"));
    }

    #[test]
    fn test_secret_keys() {
        let data = MongoEngine.secret_data("admin", "pw");
        assert_eq!(data["MONGO_INITDB_ROOT_PASSWORD"], "pw");
        assert_eq!(data["username"], "admin");
        assert_eq!(data["MONGO_INITDB_DATABASE"], "admin");
    }
}
