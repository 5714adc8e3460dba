//! 快照编解码
//!
//! 存储状态的持久化抽象：状态先经 serde 转为通用 Value，再由编解码器
//! 落成字节。默认实现为 JSON 文件；重载时 TTL 与去重索引完全由快照内
//! 的原始时间戳/哈希重建，与重载时刻无关。

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// 快照编解码器：字节格式可替换（JSON / CBOR / ...）
pub trait SnapshotCodec: Send + Sync {
    fn encode(&self, state: &serde_json::Value) -> anyhow::Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> anyhow::Result<serde_json::Value>;
}

/// JSON 编解码（默认）
#[derive(Clone, Default)]
pub struct JsonSnapshot;

impl SnapshotCodec for JsonSnapshot {
    fn encode(&self, state: &serde_json::Value) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(state)?)
    }

    fn decode(&self, bytes: &[u8]) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// 将状态编码后写入文件；父目录不存在时自动创建
pub fn save<T: Serialize>(
    codec: &dyn SnapshotCodec,
    path: &Path,
    state: &T,
) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let value = serde_json::to_value(state)?;
    let bytes = codec.encode(&value)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

/// 从文件读出并解码状态；文件不存在时返回 None
pub fn load<T: DeserializeOwned>(
    codec: &dyn SnapshotCodec,
    path: &Path,
) -> anyhow::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = std::fs::read(path)?;
    let value = codec.decode(&bytes)?;
    Ok(Some(serde_json::from_value(value)?))
}
