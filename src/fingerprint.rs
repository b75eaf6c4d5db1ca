use sha3::{Digest, Sha3_224}; // 引入 SHA3 算法和 Digest 特性(方法集)
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// 流式内容指纹
///
/// 和一次性 `fs::read` 不同，上传的证据可能是几十 GB 的磁盘镜像，
/// 所以哈希器按块喂数据，内存占用只与块大小有关。
/// 摘要只有在数据全部喂完之后 (`finish`) 才可用。
pub struct ContentHasher {
    hasher: Sha3_224,
    bytes: u64,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self {
            hasher: Sha3_224::new(),
            bytes: 0,
        }
    }

    /// 喂入一块数据
    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    /// 结束计算，返回 56 字符的小写十六进制 SHA3-224
    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// 对磁盘上的文件计算 SHA3-224 (用于任务产出的归档)
pub fn hash_file(path: &Path, chunk_size: usize) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut hasher = ContentHasher::new();
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_input_has_known_digest() {
        assert_eq!(
            ContentHasher::new().finish(),
            "6b4e03423667dbb73b6e15454f0eb1abd4597f9a1b078e3f5b5a6bc7"
        );
    }

    #[test]
    fn chunking_does_not_change_digest() {
        let data = b"bulk extractor feature file";
        let mut whole = ContentHasher::new();
        whole.update(data);

        let mut pieces = ContentHasher::new();
        for chunk in data.chunks(4) {
            pieces.update(chunk);
        }
        assert_eq!(pieces.bytes_hashed(), data.len() as u64);
        assert_eq!(whole.finish(), pieces.finish());
    }

    #[test]
    fn hash_file_matches_streaming_hasher() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"disk image bytes").unwrap();

        let mut hasher = ContentHasher::new();
        hasher.update(b"disk image bytes");
        assert_eq!(hash_file(file.path(), 3).unwrap(), hasher.finish());
    }
}
