//! 结果缓存：主题 -> 管线结果的 TTL 缓存
//!
//! 主题经大小写/空白归一化后作为唯一键，同键后写者胜。读路径是惰性
//! 过期：过期条目视为不存在但不删除，真正销毁只发生在 maintenance 清扫
//! 中，保证 get 在热路径上 O(1) 且无副作用（命中计数用原子自增，不算
//! 条目状态变更）。同时维护有界对话历史与主题关键词索引。

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};
use crate::conversation::{ConversationLog, ConversationRecord};
use crate::snapshot::{self, JsonSnapshot, SnapshotCodec};
use crate::tokenizer;

/// 主题归一化：小写 + 空白折叠，作为缓存唯一键
pub fn normalize_topic(topic: &str) -> String {
    topic
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// 缓存条目；hits 为原子计数，读命中时自增但不影响条目生命周期
struct CacheEntry {
    result: serde_json::Value,
    keywords: HashSet<String>,
    created_at: DateTime<Utc>,
    hits: AtomicU64,
}

/// 快照用的条目形态
#[derive(Serialize, Deserialize)]
struct SerEntry {
    topic_key: String,
    result: serde_json::Value,
    keywords: HashSet<String>,
    created_at: DateTime<Utc>,
    hits: u64,
}

#[derive(Serialize, Deserialize, Default)]
struct CacheSnapshot {
    entries: Vec<SerEntry>,
    history: Vec<ConversationRecord>,
}

/// 清扫统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired_removed: usize,
}

/// 结果缓存
pub struct ResultCache {
    entries: DashMap<String, CacheEntry>,
    /// 主题 -> 关键词集合；可由条目集重建，不独立持久化
    index: DashMap<String, HashSet<String>>,
    log: Mutex<ConversationLog>,
    /// 清扫用的最大条目年龄
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
    codec: Arc<dyn SnapshotCodec>,
    snapshot_path: Option<PathBuf>,
}

impl ResultCache {
    pub fn new(ttl: chrono::Duration, max_history: usize, compression_threshold: usize) -> Self {
        Self {
            entries: DashMap::new(),
            index: DashMap::new(),
            log: Mutex::new(ConversationLog::new(max_history, compression_threshold)),
            ttl,
            clock: Arc::new(SystemClock),
            codec: Arc::new(JsonSnapshot),
            snapshot_path: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn SnapshotCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// 启用快照持久化；TTL 语义按快照内原始 created_at 恢复，与重载时刻无关。
    /// 快照损坏时以空缓存启动并告警，不阻断调用方。
    pub fn with_snapshot(mut self, path: PathBuf) -> Self {
        match snapshot::load::<CacheSnapshot>(self.codec.as_ref(), &path) {
            Ok(Some(state)) => {
                for entry in state.entries {
                    self.index
                        .insert(entry.topic_key.clone(), entry.keywords.clone());
                    self.entries.insert(
                        entry.topic_key,
                        CacheEntry {
                            result: entry.result,
                            keywords: entry.keywords,
                            created_at: entry.created_at,
                            hits: AtomicU64::new(entry.hits),
                        },
                    );
                }
                {
                    let mut log = self.log.lock().unwrap();
                    for record in state.history {
                        log.push(record);
                    }
                }
                tracing::info!(entries = self.entries.len(), "result cache snapshot loaded");
            }
            Ok(None) => {}
            Err(e) => {
                let err = crate::error::MemoryError::StoreUnavailable(e.to_string());
                tracing::warn!(error = %err, "result cache snapshot corrupt, starting empty");
            }
        }
        self.snapshot_path = Some(path);
        self
    }

    /// 写入/覆盖主题结果（后写者胜），并更新关键词索引。
    /// 调用方未给关键词时从主题文本提取。
    pub fn put(&self, topic: &str, result: serde_json::Value, keywords: HashSet<String>) {
        let key = normalize_topic(topic);
        let keywords = if keywords.is_empty() {
            tokenizer::extract_keywords(&key)
        } else {
            keywords
        };
        self.index.insert(key.clone(), keywords.clone());
        self.entries.insert(
            key,
            CacheEntry {
                result,
                keywords,
                created_at: self.clock.now(),
                hits: AtomicU64::new(0),
            },
        );
        self.persist();
    }

    /// 读取主题结果；超过 max_age 视为不存在（但不删除，见 maintenance）
    pub fn get(&self, topic: &str, max_age: chrono::Duration) -> Option<serde_json::Value> {
        let key = normalize_topic(topic);
        let entry = self.entries.get(&key)?;
        if self.clock.now() - entry.created_at > max_age {
            tracing::debug!(topic = %key, "cache entry expired");
            return None;
        }
        entry.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.result.clone())
    }

    /// 按关键词 Jaccard 相似度找相关主题
    ///
    /// 相似度 >= threshold 的主题键按相似度降序返回，同分按 created_at 新者优先。
    /// 已过 TTL 未清扫的条目视同不存在（与 get 的惰性过期一致）。
    pub fn related_topics(&self, topic: &str, threshold: f32) -> Vec<String> {
        let query_keywords = tokenizer::extract_keywords(topic);
        if query_keywords.is_empty() {
            return Vec::new();
        }

        let now = self.clock.now();
        let mut scored: Vec<(String, f32, DateTime<Utc>)> = self
            .index
            .iter()
            .filter_map(|item| {
                let sim = tokenizer::jaccard_similarity(&query_keywords, item.value());
                if sim < threshold {
                    return None;
                }
                let created_at = self.entries.get(item.key())?.created_at;
                if now - created_at > self.ttl {
                    return None;
                }
                Some((item.key().clone(), sim, created_at))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.2.cmp(&a.2))
        });
        scored.into_iter().map(|(key, _, _)| key).collect()
    }

    /// 追加一条对话记录（淘汰与压缩见 conversation 模块）
    pub fn add_conversation(
        &self,
        user_text: &str,
        assistant_text: &str,
        metadata: std::collections::HashMap<String, serde_json::Value>,
    ) {
        let record = ConversationRecord::new(self.clock.now(), user_text, assistant_text, metadata);
        self.log.lock().unwrap().push(record);
        self.persist();
    }

    /// 最近 limit 条对话（时间升序）
    pub fn history(&self, limit: usize) -> Vec<ConversationRecord> {
        self.log.lock().unwrap().recent(limit)
    }

    /// 最近 n_last 条对话的上下文片段
    pub fn conversation_context(&self, n_last: usize) -> String {
        self.log.lock().unwrap().context(n_last)
    }

    /// 清扫过期条目；这是过期条目唯一真正被销毁的地方
    pub fn maintenance(&self) -> MaintenanceReport {
        let now = self.clock.now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| now - e.value().created_at > self.ttl)
            .map(|e| e.key().clone())
            .collect();

        for key in &expired {
            self.entries.remove(key);
            self.index.remove(key);
        }

        let report = MaintenanceReport {
            expired_removed: expired.len(),
        };
        if report.expired_removed > 0 {
            tracing::info!(removed = report.expired_removed, "expired cache entries swept");
            self.persist();
        }
        report
    }

    /// 命中次数（诊断用）
    pub fn hit_count(&self, topic: &str) -> Option<u64> {
        self.entries
            .get(&normalize_topic(topic))
            .map(|e| e.hits.load(Ordering::Relaxed))
    }

    /// 全部重置（条目、索引、对话历史）
    pub fn clear(&self) {
        self.entries.clear();
        self.index.clear();
        self.log.lock().unwrap().clear();
        self.persist();
    }

    /// 当前存量条目数（含已过期未清扫的）
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn persist(&self) {
        let Some(path) = &self.snapshot_path else {
            return;
        };
        let entries = self
            .entries
            .iter()
            .map(|e| SerEntry {
                topic_key: e.key().clone(),
                result: e.value().result.clone(),
                keywords: e.value().keywords.clone(),
                created_at: e.value().created_at,
                hits: e.value().hits.load(Ordering::Relaxed),
            })
            .collect();
        let history = {
            let log = self.log.lock().unwrap();
            log.recent(usize::MAX)
        };
        let state = CacheSnapshot { entries, history };
        if let Err(e) = snapshot::save(self.codec.as_ref(), path, &state) {
            tracing::warn!(error = %e, "result cache snapshot save failed");
        }
    }
}
