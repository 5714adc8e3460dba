//! 嵌入能力：语义存储的向量来源
//!
//! 通过 `Embedder` trait 注入，生产实现调用 OpenAI 兼容的 /embeddings 端点；
//! `HashEmbedder` 为无网络的确定性退化实现（词袋哈希），离线与测试可用。

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::types::embeddings::{CreateEmbeddingRequestArgs, EmbeddingInput};
use async_openai::Client;

use crate::error::EmbedError;
use crate::tokenizer;

/// 嵌入提供方：文本 -> 定长向量
///
/// 错误分两类：`Transient` 表示单条失败（批处理跳过继续），
/// `Unavailable` 表示端点不可用（整次调用失败）。
#[async_trait::async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;
}

/// 使用 async-openai 调用 OpenAI 兼容的 embeddings API
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiEmbedder {
    /// 从可选 base_url 与 API Key 创建（Key 缺省时读 OPENAI_API_KEY）
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(EmbedError::Transient("empty text".to_string()));
        }
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(EmbeddingInput::String(text.to_string()))
            .build()
            .map_err(|e| EmbedError::Transient(e.to_string()))?;
        // 端点报错一律视为不可用；单条瞬时失败留给内容问题（空文本等）
        let response = self
            .client
            .embeddings()
            .create(request)
            .await
            .map_err(|e| EmbedError::Unavailable(e.to_string()))?;
        let vec = response
            .data
            .first()
            .map(|e| e.embedding.clone())
            .unwrap_or_default();
        if vec.is_empty() {
            return Err(EmbedError::Transient("empty embedding".to_string()));
        }
        Ok(vec)
    }
}

/// 确定性词袋哈希嵌入：无网络依赖的退化实现
///
/// 每个词落入固定维度的桶中计数后归一化；词重叠越多余弦越高。
/// 不具备真实语义，只保证同文本同向量、近文本高相似。
#[derive(Clone)]
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(8) }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait::async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let tokens = tokenizer::tokenize(text);
        if tokens.is_empty() {
            return Err(EmbedError::Transient("no tokens".to_string()));
        }
        let mut v = vec![0.0f32; self.dim];
        for token in tokens {
            let mut h = DefaultHasher::new();
            token.hash(&mut h);
            v[(h.finish() as usize) % self.dim] += 1.0;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        for x in &mut v {
            *x /= norm;
        }
        Ok(v)
    }
}

/// 余弦相似度
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// 从配置创建嵌入提供方；无 API Key 时退化为 HashEmbedder
pub fn create_embedder_from_config(
    base_url: Option<&str>,
    model: &str,
    api_key: Option<&str>,
) -> Arc<dyn Embedder> {
    let key = api_key
        .map(String::from)
        .or_else(|| std::env::var("OPENAI_API_KEY").ok());
    if key.as_deref().unwrap_or("").is_empty() || key.as_deref() == Some("sk-placeholder") {
        tracing::debug!("no OPENAI_API_KEY, using hash embedder");
        return Arc::new(HashEmbedder::default());
    }
    Arc::new(OpenAiEmbedder::new(base_url, model, key.as_deref()))
}
