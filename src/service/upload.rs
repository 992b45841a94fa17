//! アップロード画像の保存
//!
//! 保存したファイルは [`StoredUpload`] が所有し、`commit` されないままドロップされると削除されます。

use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

/// 保存済みアップロード（未確定の間はドロップ時に削除）
#[derive(Debug)]
pub struct StoredUpload {
    path: PathBuf,
    filename: String,
    committed: bool,
}

impl StoredUpload {
    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 保存を確定してファイル名を返す
    pub fn commit(mut self) -> String {
        self.committed = true;
        std::mem::take(&mut self.filename)
    }
}

impl Drop for StoredUpload {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("未確定のアップロードを削除しました: {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("アップロードの削除に失敗しました {}: {}", self.path.display(), e),
        }
    }
}

/// アップロード保存ディレクトリ
#[derive(Debug, Clone)]
pub struct UploadStore {
    dir: PathBuf,
}

impl UploadStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 保存ディレクトリを作成
    pub async fn ensure_dir(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await
    }

    /// 一意な名前で保存し、未確定のガードを返す
    pub async fn save(&self, extension: &str, bytes: &[u8]) -> std::io::Result<StoredUpload> {
        self.ensure_dir().await?;
        let filename = generate_unique_filename(extension);
        let path = self.dir.join(&filename);
        // 書き込み途中で失敗しても削除されるよう先にガードを作る
        let guard = StoredUpload {
            path,
            filename,
            committed: false,
        };
        tokio::fs::write(&guard.path, bytes).await?;
        debug!("アップロードを保存しました: {}", guard.filename);
        Ok(guard)
    }

    /// 保存済みファイルのパスを解決（ディレクトリ外を指す名前は `None`）
    pub fn resolve(&self, filename: &str) -> Option<PathBuf> {
        if filename.is_empty()
            || filename.starts_with('.')
            || filename.contains(['/', '\\'])
            || filename.contains("..")
            || filename.contains('\0')
        {
            return None;
        }
        Some(self.dir.join(filename))
    }

    /// 保存済みファイルを読み込む
    pub async fn read(&self, filename: &str) -> Option<Vec<u8>> {
        let path = self.resolve(filename)?;
        tokio::fs::read(path).await.ok()
    }
}

/// 小文字化した拡張子
pub fn extension_of(filename: &str) -> Option<String> {
    let (_, ext) = filename.rsplit_once('.')?;
    if ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// ファイル名を安全な形に変換
///
/// パス区切りは `_` に置き換え、ASCII英数字と `.` `_` `-` 以外は取り除きます。
/// 先頭と末尾の `.` `_` は除去されます。
pub fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        match ch {
            c if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' => out.push(c),
            '/' | '\\' | ' ' => out.push('_'),
            _ => {}
        }
    }
    out.trim_matches(|c| c == '.' || c == '_').to_string()
}

/// `<YYYYmmdd_HHMMSS>_<uuid>.<ext>` 形式の一意なファイル名
pub fn generate_unique_filename(extension: &str) -> String {
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    format!("{}_{}.{}", timestamp, Uuid::new_v4(), extension)
}

/// 拡張子から Content-Type を推定
pub fn content_type_for(filename: &str) -> &'static str {
    match extension_of(filename).as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("my lesion.JPG"), "my_lesion.JPG");
        assert_eq!(sanitize_filename("../../etc/passwd"), "etc_passwd");
        assert_eq!(sanitize_filename("ほくろ.png"), "png");
        assert_eq!(sanitize_filename("a-b_c.jpeg"), "a-b_c.jpeg");
    }

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of("photo.PNG").as_deref(), Some("png"));
        assert_eq!(extension_of("archive.tar.gz").as_deref(), Some("gz"));
        assert_eq!(extension_of("noext"), None);
        assert_eq!(extension_of("trailing."), None);
    }

    #[test]
    fn test_unique_filename_layout() {
        let name = generate_unique_filename("png");
        let (stamp, rest) = name.split_at(15);
        assert!(stamp.chars().enumerate().all(|(i, c)| if i == 8 {
            c == '_'
        } else {
            c.is_ascii_digit()
        }));
        assert!(rest.starts_with('_'));
        assert!(rest.ends_with(".png"));
        assert_ne!(name, generate_unique_filename("png"));
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let store = UploadStore::new("/tmp/uploads");
        assert!(store.resolve("../config.json").is_none());
        assert!(store.resolve("a/b.png").is_none());
        assert!(store.resolve("..").is_none());
        assert!(store.resolve(".hidden").is_none());
        assert!(store.resolve("").is_none());
        assert_eq!(
            store.resolve("x.png"),
            Some(PathBuf::from("/tmp/uploads/x.png"))
        );
    }

    #[tokio::test]
    async fn test_uncommitted_upload_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path().join("uploads"));

        let upload = store.save("png", b"data").await.unwrap();
        let path = upload.path().to_path_buf();
        assert!(path.exists());
        drop(upload);
        assert!(!path.exists());

        let upload = store.save("jpg", b"data").await.unwrap();
        let path = upload.path().to_path_buf();
        let filename = upload.commit();
        assert!(path.exists());
        assert_eq!(store.read(&filename).await.unwrap(), b"data");
    }
}
