//! 记忆门面：单一读写策略 + 周期维护
//!
//! 读路径顺序固定：先查结果缓存（精确且最新鲜），再对语义存储做
//! source=research 的相似度软命中，最后 MISS。精确缓存命中永远优先于
//! 相似度更高的语义命中——这是延迟/新鲜度的取舍，按规格保留。
//!
//! commit 跨两个存储不做事务：缓存先写（不会失败），语义入库失败原样
//! 返回但不回滚缓存。调用方可能在 commit 后的 resolve 中观察到只有一半
//! 落库，这是接受并记录在案的行为。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::cache::ResultCache;
use crate::config::MemoryConfig;
use crate::embedding::Embedder;
use crate::error::MemoryError;
use crate::semantic_store::{AddReport, Document, RawDoc, SemanticStore};

/// 管线文档的来源标签
const SOURCE_RESEARCH: &str = "research";

/// resolve 的三种结局
#[derive(Debug, Clone)]
pub enum Resolution {
    /// 缓存精确命中：结果可直接复用
    ExactHit(serde_json::Value),
    /// 语义软命中：返回相关上下文与相近主题，不替代新一轮管线
    Related {
        context: String,
        topics: Vec<String>,
    },
    Miss,
}

/// 一次维护周期的统计
#[derive(Debug, Clone, Copy, Default)]
pub struct TickReport {
    pub expired_removed: usize,
    pub purged_documents: usize,
}

/// 双层记忆协调器
///
/// 显式构造、按句柄传递；没有全局单例。
pub struct MemoryCoordinator {
    cache: Arc<ResultCache>,
    store: Arc<SemanticStore>,
    config: MemoryConfig,
}

impl MemoryCoordinator {
    /// 按配置组装两个存储
    pub fn new(config: MemoryConfig, embedder: Arc<dyn Embedder>) -> Self {
        let ttl = chrono::Duration::seconds(config.cache.ttl_max_age_secs as i64);
        let mut cache = ResultCache::new(
            ttl,
            config.cache.max_history,
            config.cache.compression_threshold,
        );
        if let Some(path) = &config.cache.snapshot_path {
            cache = cache.with_snapshot(path.clone());
        }

        let mut store = SemanticStore::new(embedder);
        if let Some(path) = &config.semantic.snapshot_path {
            store = store.with_snapshot(path.clone());
        }

        Self {
            cache: Arc::new(cache),
            store: Arc::new(store),
            config,
        }
    }

    /// 用已构造好的存储组装（测试注入时钟/快照用）
    pub fn with_parts(config: MemoryConfig, cache: ResultCache, store: SemanticStore) -> Self {
        Self {
            cache: Arc::new(cache),
            store: Arc::new(store),
            config,
        }
    }

    /// 解析一个主题：EXACT_HIT / RELATED / MISS
    ///
    /// 从不失败：嵌入端点故障时降级为 MISS 并告警。
    pub async fn resolve(&self, topic: &str, max_age: chrono::Duration) -> Resolution {
        if let Some(result) = self.cache.get(topic, max_age) {
            tracing::info!(topic, "resolve: exact cache hit");
            return Resolution::ExactHit(result);
        }

        let mut filter = HashMap::new();
        filter.insert("source".to_string(), SOURCE_RESEARCH.to_string());
        let results = match self
            .store
            .semantic_search(topic, self.config.semantic.context_k, Some(&filter))
            .await
        {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(topic, error = %e, "resolve: semantic search degraded to miss");
                return Resolution::Miss;
            }
        };

        let min_score = self.config.semantic.min_score;
        let hits: Vec<(Document, f32)> = results
            .into_iter()
            .filter(|(_, score)| *score >= min_score)
            .collect();
        if hits.is_empty() {
            tracing::info!(topic, "resolve: miss");
            return Resolution::Miss;
        }

        let topics = self
            .cache
            .related_topics(topic, self.config.cache.related_topic_threshold);
        tracing::info!(topic, hits = hits.len(), "resolve: related context");
        Resolution::Related {
            context: crate::semantic_store::format_context(&hits),
            topics,
        }
    }

    /// 写入一轮管线结果：缓存 + 语义存储
    ///
    /// 缓存写入先行且不会失败；语义入库失败原样上抛，不回滚缓存。
    pub async fn commit(
        &self,
        topic: &str,
        result: serde_json::Value,
        documents: Vec<RawDoc>,
        keywords: HashSet<String>,
    ) -> Result<AddReport, MemoryError> {
        self.cache.put(topic, result, keywords);

        match self.store.add(documents, SOURCE_RESEARCH, true).await {
            Ok(report) => Ok(report),
            Err(e) => {
                tracing::warn!(topic, error = %e, "commit: semantic half failed, cache entry kept");
                Err(e)
            }
        }
    }

    /// 记录一轮对话（管线完成后调用）
    pub fn record_conversation(
        &self,
        user_text: &str,
        assistant_text: &str,
        metadata: HashMap<String, serde_json::Value>,
    ) {
        self.cache.add_conversation(user_text, assistant_text, metadata);
    }

    /// 执行一轮维护：缓存清扫 + 按龄清理
    pub fn tick(&self) -> TickReport {
        let swept = self.cache.maintenance();
        let purged = self.store.purge_older_than(self.config.semantic.purge_after_days);
        TickReport {
            expired_removed: swept.expired_removed,
            purged_documents: purged,
        }
    }

    /// 启动后台维护任务；取消在一个周期内生效，不会打断清扫中途
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        interval: std::time::Duration,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // interval 的首个 tick 立即返回，跳过以免启动即清扫
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!("maintenance task cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        let report = coordinator.tick();
                        tracing::debug!(
                            expired = report.expired_removed,
                            purged = report.purged_documents,
                            "maintenance tick"
                        );
                    }
                }
            }
        })
    }

    /// 语义检索直通（诊断 / CLI 只读接口）
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        filter: Option<&HashMap<String, String>>,
    ) -> Result<Vec<(Document, f32)>, MemoryError> {
        self.store.semantic_search(query, k, filter).await
    }

    /// 对话历史直通（只读）
    pub fn history(&self, limit: usize) -> Vec<crate::conversation::ConversationRecord> {
        self.cache.history(limit)
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<SemanticStore> {
        &self.store
    }
}
