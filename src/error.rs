//! 记忆子系统错误类型
//!
//! 传播策略：批处理内的单条失败在本地吸收并计入统计；嵌入端点不可用
//! 以类型化错误上抛给直接调用方；快照损坏只记录日志，存储以空状态启动。

use thiserror::Error;

/// 嵌入调用错误：区分单条瞬时失败与端点整体不可用
#[derive(Error, Debug, Clone)]
pub enum EmbedError {
    /// 单条文本嵌入失败（可跳过，批处理继续）
    #[error("transient embedding failure: {0}")]
    Transient(String),

    /// 嵌入端点不可用（本次调用整体失败）
    #[error("embedder unavailable: {0}")]
    Unavailable(String),
}

/// 记忆子系统对外错误
#[derive(Error, Debug)]
pub enum MemoryError {
    /// 嵌入端点不可用，add / search / resolve 无法完成
    #[error("embedder unavailable: {0}")]
    EmbedderUnavailable(String),

    /// 单条抽取 / 嵌入瞬时失败（通常只出现在统计里，不上抛）
    #[error("transient extraction failure: {0}")]
    TransientExtraction(String),

    /// 持久化状态不可用（启动时快照损坏等）；存储以空状态启动，
    /// 只记录日志，不上抛给调用方
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl From<EmbedError> for MemoryError {
    fn from(e: EmbedError) -> Self {
        match e {
            EmbedError::Unavailable(msg) => MemoryError::EmbedderUnavailable(msg),
            EmbedError::Transient(msg) => MemoryError::TransientExtraction(msg),
        }
    }
}
