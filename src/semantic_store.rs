//! 语义存储：内容哈希去重的向量文档库
//!
//! 文档以归一化内容的 SHA-256 为身份，同内容只存一份（先写者胜）。
//! 嵌入在进入任何分片锁之前计算完毕，慢速嵌入端点只拖慢调用延迟，
//! 不会持锁等待网络。检索为余弦相似度降序，同分按插入时间新者优先。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::clock::{Clock, SystemClock};
use crate::embedding::{cosine_similarity, Embedder};
use crate::error::{EmbedError, MemoryError};
use crate::snapshot::{self, JsonSnapshot, SnapshotCodec};

/// 待入库的原始文档（管线抽取产物）
#[derive(Debug, Clone)]
pub struct RawDoc {
    pub content: String,
    pub title: String,
    pub url: String,
}

impl RawDoc {
    pub fn new(content: impl Into<String>, title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            title: title.into(),
            url: url.into(),
        }
    }
}

/// 入库后的文档：id 为归一化内容的哈希
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub content: String,
    pub title: String,
    pub url: String,
    /// 来源标签：research / summary / synthesis
    pub source: String,
    pub embedding: Vec<f32>,
    pub inserted_at: DateTime<Utc>,
    pub word_count: usize,
}

/// 批量入库统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddReport {
    pub added: usize,
    pub skipped_duplicates: usize,
    pub failed: usize,
}

/// 清理统计之外的快照状态
#[derive(Serialize, Deserialize, Default)]
struct StoreSnapshot {
    documents: Vec<Document>,
}

/// 内容归一化：折叠空白后参与哈希，使格式差异不产生新身份
fn normalize_content(content: &str) -> String {
    content.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 归一化内容的 SHA-256（hex）
pub fn content_hash(content: &str) -> String {
    let normalized = normalize_content(content);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// 语义存储
pub struct SemanticStore {
    documents: DashMap<String, Document>,
    embedder: Arc<dyn Embedder>,
    clock: Arc<dyn Clock>,
    codec: Arc<dyn SnapshotCodec>,
    snapshot_path: Option<PathBuf>,
}

impl SemanticStore {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            documents: DashMap::new(),
            embedder,
            clock: Arc::new(SystemClock),
            codec: Arc::new(JsonSnapshot),
            snapshot_path: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// 启用快照持久化；已有快照损坏时以空库启动并记录告警，不阻断调用方
    pub fn with_snapshot(mut self, path: PathBuf) -> Self {
        match snapshot::load::<StoreSnapshot>(self.codec.as_ref(), &path) {
            Ok(Some(state)) => {
                for doc in state.documents {
                    self.documents.insert(doc.id.clone(), doc);
                }
                tracing::info!(count = self.documents.len(), "semantic store snapshot loaded");
            }
            Ok(None) => {}
            Err(e) => {
                let err = MemoryError::StoreUnavailable(e.to_string());
                tracing::warn!(error = %err, "semantic store snapshot corrupt, starting empty");
            }
        }
        self.snapshot_path = Some(path);
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn SnapshotCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// 批量入库
    ///
    /// 先并发计算整批嵌入（不持任何锁），再逐条按 id 写入。
    /// 端点不可用 -> 整次调用失败；单条嵌入失败 -> 计入 failed 继续；
    /// check_duplicates 且 id 已存在 -> 计入 skipped_duplicates（先写者胜，不覆盖）。
    pub async fn add(
        &self,
        docs: Vec<RawDoc>,
        source: &str,
        check_duplicates: bool,
    ) -> Result<AddReport, MemoryError> {
        let mut report = AddReport::default();
        if docs.is_empty() {
            return Ok(report);
        }

        let embeddings = futures_util::future::join_all(
            docs.iter().map(|d| self.embedder.embed(&d.content)),
        )
        .await;

        // 端点不可用时快速失败，区别于单条瞬时失败
        for result in &embeddings {
            if let Err(EmbedError::Unavailable(msg)) = result {
                return Err(MemoryError::EmbedderUnavailable(msg.clone()));
            }
        }

        let now = self.clock.now();
        for (doc, embedding) in docs.into_iter().zip(embeddings) {
            let embedding = match embedding {
                Ok(v) => v,
                Err(e) => {
                    tracing::debug!(title = %doc.title, error = %e, "embedding failed, skipping item");
                    report.failed += 1;
                    continue;
                }
            };

            let id = content_hash(&doc.content);
            if check_duplicates && self.documents.contains_key(&id) {
                report.skipped_duplicates += 1;
                continue;
            }

            let word_count = doc.content.split_whitespace().count();
            let stored = Document {
                id: id.clone(),
                content: doc.content,
                title: doc.title,
                url: doc.url,
                source: source.to_string(),
                embedding,
                inserted_at: now,
                word_count,
            };

            // entry API 保证同 key 写互斥；并发撞同一 id 时仍是先写者胜
            match self.documents.entry(id) {
                dashmap::mapref::entry::Entry::Occupied(_) if check_duplicates => {
                    report.skipped_duplicates += 1;
                }
                dashmap::mapref::entry::Entry::Occupied(mut o) => {
                    o.insert(stored);
                    report.added += 1;
                }
                dashmap::mapref::entry::Entry::Vacant(v) => {
                    v.insert(stored);
                    report.added += 1;
                }
            }
        }

        tracing::info!(
            source,
            added = report.added,
            skipped = report.skipped_duplicates,
            failed = report.failed,
            total = self.documents.len(),
            "documents added"
        );
        self.persist();
        Ok(report)
    }

    /// 余弦相似度检索
    ///
    /// 结果按分数降序，同分按 inserted_at 新者优先；过滤后不足 k 条
    /// 返回实际条数，空库返回空列表而非错误。
    pub async fn semantic_search(
        &self,
        query: &str,
        k: usize,
        filter: Option<&HashMap<String, String>>,
    ) -> Result<Vec<(Document, f32)>, MemoryError> {
        let k = k.max(1);
        if self.documents.is_empty() {
            return Ok(Vec::new());
        }

        let query_embedding = self.embedder.embed(query).await?;

        let mut scored: Vec<(Document, f32)> = self
            .documents
            .iter()
            .filter(|entry| matches_filter(entry.value(), filter))
            .map(|entry| {
                let score = cosine_similarity(&query_embedding, &entry.value().embedding);
                (entry.value().clone(), score)
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.0.inserted_at.cmp(&a.0.inserted_at))
        });
        scored.truncate(k);
        Ok(scored)
    }

    /// 检索并格式化为上下文片段（软命中时拼入管线提示）
    pub async fn relevant_context(
        &self,
        query: &str,
        k: usize,
        source_filter: Option<&str>,
    ) -> String {
        let filter = source_filter.map(|s| {
            let mut m = HashMap::new();
            m.insert("source".to_string(), s.to_string());
            m
        });
        match self.semantic_search(query, k, filter.as_ref()).await {
            Ok(results) => format_context(&results),
            Err(e) => {
                tracing::warn!(error = %e, "context retrieval degraded to empty");
                String::new()
            }
        }
    }

    /// 清理早于指定天数的文档，返回删除条数
    pub fn purge_older_than(&self, days: i64) -> usize {
        let cutoff = self.clock.now() - chrono::Duration::days(days);
        let before = self.documents.len();
        self.documents.retain(|_, doc| doc.inserted_at >= cutoff);
        let removed = before - self.documents.len();
        if removed > 0 {
            tracing::info!(removed, days, "old documents purged");
            self.persist();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// 写快照；失败只告警（存储本体仍在内存中有效）
    fn persist(&self) {
        let Some(path) = &self.snapshot_path else {
            return;
        };
        let state = StoreSnapshot {
            documents: self.documents.iter().map(|e| e.value().clone()).collect(),
        };
        if let Err(e) = snapshot::save(self.codec.as_ref(), path, &state) {
            tracing::warn!(error = %e, "semantic store snapshot save failed");
        }
    }
}

/// 将检索结果格式化为上下文片段
pub fn format_context(results: &[(Document, f32)]) -> String {
    if results.is_empty() {
        return String::new();
    }
    let mut parts = Vec::new();
    for (i, (doc, score)) in results.iter().enumerate() {
        let preview: String = doc.content.chars().take(500).collect();
        parts.push(format!(
            "[Source {} - score {:.2}]\nTitle: {}\n{}\n",
            i + 1,
            score,
            doc.title,
            preview
        ));
    }
    parts.join("\n---\n")
}

/// 精确匹配过滤：source / title / url
fn matches_filter(doc: &Document, filter: Option<&HashMap<String, String>>) -> bool {
    let Some(filter) = filter else { return true };
    filter.iter().all(|(key, expected)| match key.as_str() {
        "source" => doc.source == *expected,
        "title" => doc.title == *expected,
        "url" => doc.url == *expected,
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::embedding::HashEmbedder;
    use tempfile::TempDir;

    fn store() -> SemanticStore {
        SemanticStore::new(Arc::new(HashEmbedder::default()))
    }

    /// 总是失败的嵌入端点
    struct DownEmbedder;

    #[async_trait::async_trait]
    impl Embedder for DownEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbedError> {
            Err(EmbedError::Unavailable("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_add_and_count() {
        let store = store();
        let report = store
            .add(
                vec![
                    RawDoc::new("l'ia transforme le marché du travail", "Doc A", "http://a"),
                    RawDoc::new("les modèles de langage en entreprise", "Doc B", "http://b"),
                ],
                "research",
                true,
            )
            .await
            .unwrap();
        assert_eq!(report.added, 2);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_dedup_is_idempotent() {
        let store = store();
        let doc = || vec![RawDoc::new("contenu identique pour dédup", "T", "u")];

        let first = store.add(doc(), "research", true).await.unwrap();
        assert_eq!(first.added, 1);

        let second = store.add(doc(), "research", true).await.unwrap();
        assert_eq!(second.added, 0);
        assert_eq!(second.skipped_duplicates, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_dedup_normalizes_whitespace() {
        let store = store();
        store
            .add(vec![RawDoc::new("même  contenu\nnormalisé", "A", "")], "research", true)
            .await
            .unwrap();
        let report = store
            .add(vec![RawDoc::new("même contenu normalisé", "B", "")], "research", true)
            .await
            .unwrap();
        assert_eq!(report.skipped_duplicates, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_search_ordering_and_k() {
        let store = store();
        store
            .add(
                vec![
                    RawDoc::new("intelligence artificielle et emploi en france", "近", "u1"),
                    RawDoc::new("recette de cuisine traditionnelle", "远", "u2"),
                    RawDoc::new("emploi et automatisation industrielle", "中", "u3"),
                ],
                "research",
                true,
            )
            .await
            .unwrap();

        let results = store
            .semantic_search("intelligence artificielle emploi", 2, None)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        // 分数非增
        assert!(results[0].1 >= results[1].1);
        // top-1 是词重叠最高的文档
        assert_eq!(results[0].0.url, "u1");
    }

    #[tokio::test]
    async fn test_search_empty_store_returns_empty() {
        let store = store();
        let results = store.semantic_search("anything", 5, None).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_search_filter_by_source() {
        let store = store();
        store
            .add(vec![RawDoc::new("sujet partagé version recherche", "A", "")], "research", true)
            .await
            .unwrap();
        store
            .add(vec![RawDoc::new("sujet partagé version résumé", "B", "")], "summary", true)
            .await
            .unwrap();

        let mut filter = HashMap::new();
        filter.insert("source".to_string(), "summary".to_string());
        let results = store
            .semantic_search("sujet partagé", 10, Some(&filter))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0.source, "summary");
    }

    #[tokio::test]
    async fn test_embedder_down_fails_whole_add() {
        let store = SemanticStore::new(Arc::new(DownEmbedder));
        let err = store
            .add(vec![RawDoc::new("n'importe quoi", "T", "")], "research", true)
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::EmbedderUnavailable(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_is_tallied_not_raised() {
        let store = store();
        // 空白内容分不出词 -> 单条瞬时失败，批处理仍完成
        let report = store
            .add(
                vec![
                    RawDoc::new("   ", "vide", ""),
                    RawDoc::new("document valide sur l'ia", "ok", ""),
                ],
                "research",
                true,
            )
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.added, 1);
    }

    #[tokio::test]
    async fn test_relevant_context_formatting() {
        let store = store();
        store
            .add(
                vec![RawDoc::new("analyse du marché de l'emploi", "Analyse", "u")],
                "research",
                true,
            )
            .await
            .unwrap();

        let ctx = store.relevant_context("marché emploi", 3, Some("research")).await;
        assert!(ctx.contains("[Source 1"));
        assert!(ctx.contains("Analyse"));

        // 来源过滤不匹配 -> 空上下文
        let none = store.relevant_context("marché emploi", 3, Some("summary")).await;
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_purge_boundary() {
        let clock = ManualClock::new(Utc::now());
        let store = SemanticStore::new(Arc::new(HashEmbedder::default()))
            .with_clock(Arc::new(clock.clone()));

        store
            .add(vec![RawDoc::new("vieux document archivé", "old", "")], "research", true)
            .await
            .unwrap();
        clock.advance(chrono::Duration::days(30));
        store
            .add(vec![RawDoc::new("document récent pertinent", "new", "")], "research", true)
            .await
            .unwrap();
        clock.advance(chrono::Duration::days(1));

        // old 此刻 31 天，new 1 天
        let removed = store.purge_older_than(30);
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);

        let remaining = store.semantic_search("document", 5, None).await.unwrap();
        assert_eq!(remaining[0].0.title, "new");
    }

    #[tokio::test]
    async fn test_snapshot_reload_preserves_dedup() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");

        {
            let store = SemanticStore::new(Arc::new(HashEmbedder::default()))
                .with_snapshot(path.clone());
            store
                .add(vec![RawDoc::new("contenu persistant unique", "P", "")], "research", true)
                .await
                .unwrap();
        }

        let reloaded = SemanticStore::new(Arc::new(HashEmbedder::default()))
            .with_snapshot(path.clone());
        assert_eq!(reloaded.len(), 1);

        // 重载后的去重索引必须拦截同内容
        let report = reloaded
            .add(vec![RawDoc::new("contenu persistant unique", "P2", "")], "research", true)
            .await
            .unwrap();
        assert_eq!(report.skipped_duplicates, 1);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, b"{broken").unwrap();

        let store = SemanticStore::new(Arc::new(HashEmbedder::default()))
            .with_snapshot(path);
        assert!(store.is_empty());
    }
}
