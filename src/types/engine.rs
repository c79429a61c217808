//! Engine-specific configuration (MongoDB / Redis)
//!
//! 사용자 config map 은 자유 형식 JSON 이지만 엔진별 typed struct 로 검증한다.
//! 같은 struct 를 reconciler 가 설정 파일 렌더링에 사용

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::instance::{DbMode, DbType, ResourceSpec};
use crate::error::ApiError;

pub const MONGODB_VERSIONS: &[&str] = &["6.0", "7.0"];
pub const REDIS_VERSIONS: &[&str] = &["7.0", "7.2"];

const MAXMEMORY_POLICIES: &[&str] = &[
    "noeviction",
    "allkeys-lru",
    "allkeys-lfu",
    "allkeys-random",
    "volatile-lru",
    "volatile-lfu",
    "volatile-random",
    "volatile-ttl",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MongoConfig {
    #[serde(default = "default_mongo_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "wiredTigerCacheSizeGB")]
    pub wired_tiger_cache_size_gb: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replica_count: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_count: Option<i32>,
}

fn default_mongo_version() -> String {
    "7.0".to_string()
}

impl MongoConfig {
    pub fn validate(&self, mode: DbMode, resources: &ResourceSpec) -> Result<(), ApiError> {
        if !MONGODB_VERSIONS.contains(&self.version.as_str()) {
            return Err(config_error(format!("unsupported mongodb version {}", self.version)));
        }

        match mode {
            DbMode::Standalone => {
                if self.replica_count.is_some() || self.shard_count.is_some() {
                    return Err(config_error("replicaCount/shardCount not allowed in standalone mode"));
                }
            }
            DbMode::ReplicaSet => {
                if self.shard_count.is_some() {
                    return Err(config_error("shardCount not allowed in replica_set mode"));
                }
            }
            DbMode::Sharded => {
                if self.replica_count.is_some() {
                    return Err(config_error("replicaCount not allowed in sharded mode"));
                }
            }
            _ => return Err(config_error(format!("mode {} is not a mongodb mode", mode.as_str()))),
        }

        if let Some(count) = self.replica_count {
            if ![3, 5, 7].contains(&count) {
                return Err(config_error("replicaCount must be 3, 5 or 7"));
            }
        }

        if let Some(count) = self.shard_count {
            if !(2..=10).contains(&count) {
                return Err(config_error("shardCount must be between 2 and 10"));
            }
        }

        if let Some(cache) = self.wired_tiger_cache_size_gb {
            if !(1..=128).contains(&cache) {
                return Err(config_error("wiredTigerCacheSizeGB must be between 1 and 128"));
            }
            // 메모리의 50% 이하
            let max_cache = resources.memory / 2 / 1024;
            if cache > max_cache {
                return Err(config_error(format!(
                    "wiredTigerCacheSizeGB cannot exceed 50% of memory ({}GB max)",
                    max_cache
                )));
            }
        }

        Ok(())
    }

    pub fn replicas(&self, mode: DbMode) -> i32 {
        match mode {
            DbMode::ReplicaSet => self.replica_count.unwrap_or(3),
            DbMode::Sharded => self.shard_count.unwrap_or(2),
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceMode {
    Rdb,
    Aof,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RedisConfig {
    #[serde(default = "default_redis_version")]
    pub version: String,
    #[serde(default = "default_true")]
    pub persistence: bool,
    #[serde(default = "default_persistence_mode")]
    pub persistence_mode: PersistenceMode,
    #[serde(default = "default_maxmemory_policy")]
    pub maxmemory_policy: String,
}

fn default_redis_version() -> String {
    "7.2".to_string()
}

fn default_true() -> bool {
    true
}

fn default_persistence_mode() -> PersistenceMode {
    PersistenceMode::Rdb
}

fn default_maxmemory_policy() -> String {
    "allkeys-lru".to_string()
}

impl RedisConfig {
    pub fn validate(&self, mode: DbMode) -> Result<(), ApiError> {
        if !REDIS_VERSIONS.contains(&self.version.as_str()) {
            return Err(config_error(format!("unsupported redis version {}", self.version)));
        }
        if !MAXMEMORY_POLICIES.contains(&self.maxmemory_policy.as_str()) {
            return Err(config_error(format!(
                "unknown maxmemoryPolicy {}",
                self.maxmemory_policy
            )));
        }
        if !mode.is_valid_for(DbType::Redis) {
            return Err(config_error(format!("mode {} is not a redis mode", mode.as_str())));
        }
        Ok(())
    }

    pub fn replicas(&self, mode: DbMode) -> i32 {
        match mode {
            DbMode::Sentinel => 3,
            DbMode::Cluster => 6,
            _ => 1,
        }
    }
}

/// 검증된 엔진 설정
#[derive(Debug, Clone, PartialEq)]
pub enum EngineConfig {
    Mongo(MongoConfig),
    Redis(RedisConfig),
}

impl EngineConfig {
    /// config map 파싱 (누락 필드는 기본값)
    pub fn parse(db_type: DbType, config: &Map<String, Value>) -> Result<Self, ApiError> {
        let value = Value::Object(config.clone());
        match db_type {
            DbType::Mongodb => serde_json::from_value(value)
                .map(EngineConfig::Mongo)
                .map_err(|e| config_error(e.to_string())),
            DbType::Redis => serde_json::from_value(value)
                .map(EngineConfig::Redis)
                .map_err(|e| config_error(e.to_string())),
        }
    }

    /// 구조 + 모드/리소스 제약 검증
    pub fn validate(
        db_type: DbType,
        mode: DbMode,
        config: &Map<String, Value>,
        resources: &ResourceSpec,
    ) -> Result<Self, ApiError> {
        let parsed = Self::parse(db_type, config)?;
        match &parsed {
            EngineConfig::Mongo(c) => c.validate(mode, resources)?,
            EngineConfig::Redis(c) => c.validate(mode)?,
        }
        Ok(parsed)
    }

    pub fn version(&self) -> &str {
        match self {
            EngineConfig::Mongo(c) => &c.version,
            EngineConfig::Redis(c) => &c.version,
        }
    }

    pub fn replicas(&self, mode: DbMode) -> i32 {
        match self {
            EngineConfig::Mongo(c) => c.replicas(mode),
            EngineConfig::Redis(c) => c.replicas(mode),
        }
    }
}

/// 엔진 기본 설정
pub fn default_config(db_type: DbType) -> Map<String, Value> {
    let value = match db_type {
        DbType::Mongodb => json!({ "version": default_mongo_version() }),
        DbType::Redis => json!({
            "version": default_redis_version(),
            "persistence": true,
            "persistenceMode": "rdb",
            "maxmemoryPolicy": default_maxmemory_policy(),
        }),
    };
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// 기본값 위에 사용자 설정 덮어쓰기
pub fn merge_config(base: &Map<String, Value>, overrides: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = base.clone();
    for (k, v) in overrides {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

fn config_error(reason: impl Into<String>) -> ApiError {
    ApiError::invalid_param("config", reason)
}
