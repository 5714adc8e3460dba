//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `RECALL__*` 覆盖
//! （双下划线表示嵌套，如 `RECALL__CACHE__MAX_HISTORY=200`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct MemoryConfig {
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub semantic: SemanticSection,
    #[serde(default)]
    pub maintenance: MaintenanceSection,
    #[serde(default)]
    pub embedding: EmbeddingSection,
}

/// [cache] 段：TTL、历史上限、压缩阈值、相关主题阈值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    /// 缓存条目最大年龄（秒）
    pub ttl_max_age_secs: u64,
    /// 对话历史保留条数上限
    pub max_history: usize,
    /// 超过该条数时触发对话压缩
    pub compression_threshold: usize,
    /// 相关主题的 Jaccard 相似度下限（0~1）
    pub related_topic_threshold: f32,
    /// 快照文件路径，未设置时不持久化
    pub snapshot_path: Option<PathBuf>,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            ttl_max_age_secs: 86_400,
            max_history: 100,
            compression_threshold: 50,
            related_topic_threshold: 0.5,
            snapshot_path: None,
        }
    }
}

/// [semantic] 段：保留天数、软命中分数下限、上下文条数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SemanticSection {
    /// 文档保留天数，超过后由维护清理
    pub purge_after_days: i64,
    /// resolve 软命中的最低余弦相似度
    pub min_score: f32,
    /// 软命中时返回的上下文文档条数
    pub context_k: usize,
    /// 快照文件路径，未设置时不持久化
    pub snapshot_path: Option<PathBuf>,
}

impl Default for SemanticSection {
    fn default() -> Self {
        Self {
            purge_after_days: 30,
            min_score: 0.35,
            context_k: 3,
            snapshot_path: None,
        }
    }
}

/// [maintenance] 段：后台维护周期
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MaintenanceSection {
    /// tick 间隔（秒）
    pub tick_interval_secs: u64,
}

impl Default for MaintenanceSection {
    fn default() -> Self {
        Self {
            tick_interval_secs: 300,
        }
    }
}

/// [embedding] 段：模型与端点（API Key 从 OPENAI_API_KEY 读取）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingSection {
    pub model: String,
    pub base_url: Option<String>,
}

impl Default for EmbeddingSection {
    fn default() -> Self {
        Self {
            model: "text-embedding-3-small".to_string(),
            base_url: None,
        }
    }
}

/// 从 config 目录加载配置，环境变量 RECALL__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 RECALL__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<MemoryConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("RECALL")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = MemoryConfig::default();
        assert_eq!(cfg.cache.ttl_max_age_secs, 86_400);
        assert_eq!(cfg.cache.max_history, 100);
        assert_eq!(cfg.cache.compression_threshold, 50);
        assert_eq!(cfg.semantic.purge_after_days, 30);
        assert!(cfg.semantic.min_score > 0.0);
    }
}
