//! Recall - 研究管线的双层记忆子系统
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **clock**: 时间源抽象（TTL / 按龄清理的可测试性）
//! - **embedding**: 嵌入能力抽象与 OpenAI 兼容实现
//! - **tokenizer**: 中英文混合分词与主题关键词提取
//! - **semantic_store**: 持久语义存储（内容哈希去重 + 余弦检索 + 按龄清理）
//! - **cache**: 结果缓存（TTL + 主题索引 + 相关主题）
//! - **conversation**: 有界对话历史与压缩
//! - **snapshot**: 快照编解码（JSON 文件持久化）
//! - **coordinator**: 双层记忆门面（resolve / commit / tick）
//!
//! 管线本身（搜索、抽取、提示词、报告）是外部调用方，不在本 crate 内。

pub mod cache;
pub mod clock;
pub mod config;
pub mod conversation;
pub mod coordinator;
pub mod embedding;
pub mod error;
pub mod observability;
pub mod semantic_store;
pub mod snapshot;
pub mod tokenizer;

pub use cache::{MaintenanceReport, ResultCache};
pub use clock::{Clock, SystemClock};
pub use config::MemoryConfig;
pub use conversation::{ConversationLog, ConversationRecord};
pub use coordinator::{MemoryCoordinator, Resolution, TickReport};
pub use embedding::{Embedder, OpenAiEmbedder};
pub use error::{EmbedError, MemoryError};
pub use semantic_store::{AddReport, Document, RawDoc, SemanticStore};
