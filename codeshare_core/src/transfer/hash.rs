use crate::error::Result;
use blake3::Hasher;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use super::constants::BUFFER_SIZE;

/// BLAKE3 of a file on disk, hex
pub async fn compute_file_hash(file_path: &Path) -> Result<String> {
    let mut file = File::open(file_path).await?;
    let mut hasher = Hasher::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}

/// BLAKE3 of reconstructed bytes; large inputs hash on the rayon pool
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Hasher::new();
    if data.len() >= BUFFER_SIZE {
        hasher.update_rayon(data);
    } else {
        hasher.update(data);
    }
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_and_bytes_agree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let data: Vec<u8> = (0..3 * BUFFER_SIZE / 2).map(|i| (i % 251) as u8).collect();
        tokio::fs::write(&path, &data).await.unwrap();

        assert_eq!(compute_file_hash(&path).await.unwrap(), hash_bytes(&data));
    }
}
