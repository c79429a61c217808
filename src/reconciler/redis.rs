//! Redis 워크로드

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, ContainerPort, VolumeMount};

use super::engine::{
    exec_probe, resource_requirements, secret_env, Engine, LIVENESS_TIMING, READINESS_TIMING,
};
use crate::error::{ApiError, ApiResult};
use crate::k8s::DbInstanceSpec;
use crate::types::{DbMode, EngineConfig, PersistenceMode, RedisConfig, REDIS_PORT};

pub struct RedisEngine;

fn parse(spec: &DbInstanceSpec) -> ApiResult<RedisConfig> {
    match EngineConfig::parse(spec.db_type, &spec.config)? {
        EngineConfig::Redis(config) => Ok(config),
        EngineConfig::Mongo(_) => Err(ApiError::invalid_param("config", "not a redis config")),
    }
}

const AOF_BLOCK: &str = "
# AOF persistence
appendonly yes
appendfilename \"appendonly.aof\"
appendfsync everysec
no-appendfsync-on-rewrite no
auto-aof-rewrite-percentage 100
auto-aof-rewrite-min-size 64mb
";

const RDB_BLOCK: &str = "
# RDB persistence
save 900 1
save 300 10
save 60 10000
stop-writes-on-bgsave-error yes
rdbcompression yes
rdbchecksum yes
dbfilename dump.rdb
";

const CLUSTER_BLOCK: &str = "
# Cluster
cluster-enabled yes
cluster-config-file nodes.conf
cluster-node-timeout 5000
";

impl Engine for RedisEngine {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn port(&self) -> i32 {
        REDIS_PORT
    }

    fn config_file_name(&self) -> &'static str {
        "redis.conf"
    }

    fn config_mount_path(&self) -> &'static str {
        "/etc/redis"
    }

    fn render_config(&self, spec: &DbInstanceSpec) -> ApiResult<String> {
        let config = parse(spec)?;

        let mut conf = format!(
            "# Redis configuration\n\
             port {}\n\
             bind 0.0.0.0\n\
             protected-mode yes\n\
             tcp-backlog 511\n\
             timeout 0\n\
             tcp-keepalive 300\n",
            REDIS_PORT
        );

        if config.persistence {
            conf.push_str(match config.persistence_mode {
                PersistenceMode::Aof => AOF_BLOCK,
                PersistenceMode::Rdb => RDB_BLOCK,
            });
        } else {
            conf.push_str("\nsave \"\"\nappendonly no\n");
        }

        conf.push_str(&format!(
            "\n# Memory management\nmaxmemory {}mb\nmaxmemory-policy {}\n",
            spec.resources.memory, config.maxmemory_policy
        ));

        if spec.mode == DbMode::Cluster {
            conf.push_str(CLUSTER_BLOCK);
        }

        Ok(conf)
    }

    fn container(&self, spec: &DbInstanceSpec, secret_name: &str) -> ApiResult<Container> {
        let config = parse(spec)?;

        let mut command = vec![
            "redis-server".to_string(),
            format!("{}/{}", self.config_mount_path(), self.config_file_name()),
            "--requirepass".to_string(),
            "$(REDIS_PASSWORD)".to_string(),
        ];

        let mut mounts = vec![VolumeMount {
            name: "config".to_string(),
            mount_path: self.config_mount_path().to_string(),
            ..Default::default()
        }];

        if config.persistence {
            command.extend(["--dir".to_string(), "/data".to_string()]);
            mounts.push(VolumeMount {
                name: "data".to_string(),
                mount_path: "/data".to_string(),
                ..Default::default()
            });
        }

        let ping = [
            "sh",
            "-c",
            "redis-cli --no-auth-warning -a \"$REDIS_PASSWORD\" ping | grep -q PONG",
        ];

        Ok(Container {
            name: self.name().to_string(),
            image: Some(format!("redis:{}", config.version)),
            command: Some(command),
            ports: Some(vec![ContainerPort {
                name: Some(self.name().to_string()),
                container_port: REDIS_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            env: Some(vec![secret_env("REDIS_PASSWORD", secret_name, "REDIS_PASSWORD")]),
            resources: Some(resource_requirements(&spec.resources)),
            volume_mounts: Some(mounts),
            liveness_probe: Some(exec_probe(&ping, LIVENESS_TIMING)),
            readiness_probe: Some(exec_probe(&ping, READINESS_TIMING)),
            ..Default::default()
        })
    }

    fn has_data_volume(&self, spec: &DbInstanceSpec) -> ApiResult<bool> {
        Ok(parse(spec)?.persistence)
    }

    fn secret_data(&self, _username: &str, password: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("password".to_string(), password.to_string()),
            ("REDIS_PASSWORD".to_string(), password.to_string()),
        ])
    }

    fn backup_image(&self) -> &'static str {
        "redis:7.2"
    }

    fn backup_script(&self) -> &'static str {
        r#"set -e
NAME="${BACKUP_NAME:-redis-$(date +%Y%m%d_%H%M%S)}"
echo "starting redis backup ${NAME}"
redis-cli -h "${DB_HOST}" -p "${DB_PORT}" --no-auth-warning -a "${REDIS_PASSWORD}" --rdb "/backup/${NAME}.rdb"
echo "backup completed: ${NAME}.rdb"
find /backup -name "*.rdb" -mtime +"${BACKUP_RETENTION_DAYS}" -exec rm {} \;
"#
    }

    /// 데이터 볼륨(ordinal 0)에 RDB 를 놓고 서버를 저장 없이 재시작
    fn restore_script(&self) -> &'static str {
        r#"set -e
test -f "/backup/${BACKUP_NAME}.rdb"
rm -rf /data/appendonlydir /data/appendonly.aof
cp "/backup/${BACKUP_NAME}.rdb" /data/dump.rdb
redis-cli -h "${DB_HOST}" -p "${DB_PORT}" --no-auth-warning -a "${REDIS_PASSWORD}" SHUTDOWN NOSAVE || true
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
            name: "cache".into(),
            db_type: DbType::Redis,
            size: DbSize::Small,
            mode,
            secret_ref: SecretRef { name: "cache-secret".into() },
            created_from_preset: None,
            resources: ResourceSpec { cpu: 1, memory: 512, disk: 5 },
            backup: BackupConfig::default(),
            user_id: "u1".into(),
            config,
            external_id: "e1".into(),
        }
    }

    #[test]
    fn test_aof_cluster_config() {
        let spec = spec(
            DbMode::Cluster,
            json!({ "persistenceMode": "aof", "maxmemoryPolicy": "noeviction" }),
        );
        let conf = RedisEngine.render_config(&spec).unwrap();

        assert!(conf.contains("appendonly yes"));
        assert!(!conf.contains("save 900 1"));
        assert!(conf.contains("maxmemory 512mb"));
        assert!(conf.contains("maxmemory-policy noeviction"));
        assert!(conf.contains("cluster-enabled yes"));
    }

    #[test]
    fn test_default_rdb_with_data_volume() {
        let spec = spec(DbMode::Basic, json!({}));
        let conf = RedisEngine.render_config(&spec).unwrap();
        assert!(conf.contains("save 900 1"));
        assert!(!conf.contains("cluster-enabled"));
        assert!(RedisEngine.has_data_volume(&spec).unwrap());

        let container = RedisEngine.container(&spec, "cache-secret").unwrap();
        let command = container.command.unwrap();
        assert_eq!(command[0], "redis-server");
        assert_eq!(command[1], "/etc/redis/redis.conf");
        assert!(command.contains(&"$(REDIS_PASSWORD)".to_string()));
        assert!(command.contains(&"/data".to_string()));
    }

    #[test]
    fn test_no_persistence_means_no_data_volume() {
        let spec = spec(DbMode::Basic, json!({ "persistence": false }));
        assert!(!RedisEngine.has_data_volume(&spec).unwrap());

        let container = RedisEngine.container(&spec, "cache-secret").unwrap();
        assert_eq!(container.volume_mounts.unwrap().len(), 1);
        assert!(RedisEngine.render_config(&spec).unwrap().contains("appendonly no"));
    }
}
