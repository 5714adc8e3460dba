//! 有界对话历史
//!
//! 保留最近 max_history 条记录，超出时 FIFO 淘汰；条数越过
//! compression_threshold 后先压缩：把最旧的一半折叠为一条摘要记录，
//! 但最近 compression_threshold 条必须原样保留，压缩后的总条数不会
//! 低于 max_history - compression_threshold。

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 单条对话记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub timestamp: DateTime<Utc>,
    pub user_text: String,
    pub assistant_text: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ConversationRecord {
    pub fn new(
        timestamp: DateTime<Utc>,
        user_text: impl Into<String>,
        assistant_text: impl Into<String>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            timestamp,
            user_text: user_text.into(),
            assistant_text: assistant_text.into(),
            metadata,
        }
    }

    /// 是否为压缩产生的摘要记录
    pub fn is_compacted(&self) -> bool {
        self.metadata.contains_key("compacted")
    }
}

/// 有界对话环：追加写，FIFO 淘汰，越过阈值后折叠最旧一半
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationLog {
    records: VecDeque<ConversationRecord>,
    max_history: usize,
    compression_threshold: usize,
}

impl ConversationLog {
    pub fn new(max_history: usize, compression_threshold: usize) -> Self {
        Self {
            records: VecDeque::new(),
            max_history: max_history.max(1),
            compression_threshold: compression_threshold.max(1),
        }
    }

    pub fn push(&mut self, record: ConversationRecord) {
        self.records.push_back(record);
        if self.records.len() > self.compression_threshold {
            self.compact();
        }
        while self.records.len() > self.max_history {
            self.records.pop_front();
        }
    }

    /// 最近 limit 条（时间升序）
    pub fn recent(&self, limit: usize) -> Vec<ConversationRecord> {
        let skip = self.records.len().saturating_sub(limit);
        self.records.iter().skip(skip).cloned().collect()
    }

    /// 格式化最近 n_last 条为上下文片段
    pub fn context(&self, n_last: usize) -> String {
        let recent = self.recent(n_last);
        if recent.is_empty() {
            return String::new();
        }
        let mut s = String::from("Recent research exchanges:\n");
        for (i, rec) in recent.iter().enumerate() {
            let user: String = rec.user_text.chars().take(100).collect();
            let assistant: String = rec.assistant_text.chars().take(100).collect();
            s.push_str(&format!("\n[{}]\nUser: {}\nAssistant: {}\n", i + 1, user, assistant));
        }
        s
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// 折叠最旧的一半为一条摘要记录
    ///
    /// 折叠条数取 len/2 与「最近 compression_threshold 条之外」的较小值；
    /// 不足 2 条时折叠没有收益，直接跳过。摘要记录沿用被折叠记录中最新
    /// 的时间戳，保持环内时间单调。
    fn compact(&mut self) {
        let n = self.records.len();
        let collapsible = n.saturating_sub(self.compression_threshold);
        let collapse = (n / 2).min(collapsible);
        if collapse < 2 {
            return;
        }

        let collapsed: Vec<ConversationRecord> = self.records.drain(..collapse).collect();
        let newest_ts = collapsed
            .iter()
            .map(|r| r.timestamp)
            .max()
            .unwrap_or_else(Utc::now);
        let total: usize = collapsed
            .iter()
            .map(|r| {
                r.metadata
                    .get("compacted")
                    .and_then(|v| v.as_u64())
                    .map(|v| v as usize)
                    .unwrap_or(1)
            })
            .sum();

        let mut metadata = HashMap::new();
        metadata.insert("compacted".to_string(), serde_json::json!(total));
        self.records.push_front(ConversationRecord::new(
            newest_ts,
            String::new(),
            format!("[compacted {} earlier exchanges]", total),
            metadata,
        ));
        tracing::debug!(collapsed = collapse, total, "conversation history compacted");
    }
}
