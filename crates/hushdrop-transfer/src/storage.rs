use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use uuid::Uuid;

use hushdrop_types::ReceivedFile;

/// Name used when the sender's file name is unusable.
const FALLBACK_NAME: &str = "received_file";

const WRITE_BUF_SIZE: usize = 64 * 1024;

/// Bytes of the file name kept in a staging name. The uuid makes it unique.
const STAGING_NAME_PREFIX: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),

    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),
}

/// The download directory.
///
/// Received data is first written to a hidden `.{name prefix}.{uuid}.part`
/// file and only renamed to its final name once the stream authenticated.
#[derive(Debug, Clone)]
pub struct Storage {
    dir: PathBuf,
}

impl Storage {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        if !dir.is_dir() {
            return Err(StorageError::NotADirectory(dir));
        }
        info!("Download directory: {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Open a staging file for a received file name.
    pub fn stage(&self, file_name: &str) -> Result<StagedFile, StorageError> {
        let file_name = sanitize_file_name(file_name);
        let part_path = self
            .dir
            .join(format!(".{}.{}.part", name_prefix(&file_name), Uuid::new_v4()));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&part_path)?;
        debug!("Staging {} at {}", file_name, part_path.display());

        Ok(StagedFile {
            writer: Some(BufWriter::with_capacity(WRITE_BUF_SIZE, file)),
            part_path,
            dir: self.dir.clone(),
            file_name,
            written: 0,
        })
    }
}

/// Hidden partial output. Deleted on drop unless committed.
#[derive(Debug)]
pub struct StagedFile {
    writer: Option<BufWriter<File>>,
    part_path: PathBuf,
    dir: PathBuf,
    file_name: String,
    written: u64,
}

impl StagedFile {
    pub fn part_path(&self) -> &Path {
        &self.part_path
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush buffered data and fsync the staging file.
    pub fn sync(&mut self) -> io::Result<()> {
        let writer = self.writer_mut()?;
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Move the staged data to a visible, non-colliding name in the directory.
    pub fn commit(mut self) -> Result<ReceivedFile, StorageError> {
        self.sync()?;
        // Close before renaming.
        self.writer = None;

        let final_path = claim_unique_path(&self.dir, &self.file_name)?;
        // Only replaces the empty placeholder claimed above.
        if let Err(e) = fs::rename(&self.part_path, &final_path) {
            let _ = fs::remove_file(&final_path);
            return Err(e.into());
        }
        info!("Saved {} ({} bytes)", final_path.display(), self.written);

        let file_name = final_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.file_name.clone());
        let received = ReceivedFile {
            mime_type: mime_type_for(&file_name).to_string(),
            file_name,
            path: final_path,
            size: self.written,
        };
        // Nothing left to clean up.
        self.part_path = PathBuf::new();
        Ok(received)
    }

    fn writer_mut(&mut self) -> io::Result<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| io::Error::other("staged file already closed"))
    }
}

impl Write for StagedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.writer_mut()?.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer_mut()?.flush()
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if self.part_path.as_os_str().is_empty() {
            return;
        }
        // Close before removing.
        self.writer = None;
        match fs::remove_file(&self.part_path) {
            Ok(()) => debug!("Discarded partial file {}", self.part_path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to remove partial file {}: {}",
                self.part_path.display(),
                e
            ),
        }
    }
}

/// Keep only the last path component of a peer-supplied name.
pub fn sanitize_file_name(name: &str) -> String {
    let last = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = last.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();
    match cleaned {
        "" | "." | ".." => FALLBACK_NAME.to_string(),
        other => other.to_string(),
    }
}

/// At most `STAGING_NAME_PREFIX` bytes of `name`, cut on a char boundary.
fn name_prefix(name: &str) -> &str {
    let mut len = name.len().min(STAGING_NAME_PREFIX);
    while !name.is_char_boundary(len) {
        len -= 1;
    }
    &name[..len]
}

/// Create an empty file at the first free name of `name.ext`,
/// `name (1).ext`, `name (2).ext`, ... The check and the claim are one
/// `create_new`, so a file that appears meanwhile is skipped, never replaced.
fn claim_unique_path(dir: &Path, file_name: &str) -> io::Result<PathBuf> {
    let as_path = Path::new(file_name);
    let stem = as_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string());
    let ext = as_path.extension().map(|e| e.to_string_lossy().into_owned());

    let mut n = 0u32;
    loop {
        let name = match (n, &ext) {
            (0, _) => file_name.to_string(),
            (_, Some(ext)) => format!("{} ({}).{}", stem, n, ext),
            (_, None) => format!("{} ({})", stem, n),
        };
        let candidate = dir.join(name);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => n += 1,
            Err(e) => return Err(e),
        }
    }
}

/// MIME type from the file name suffix (case-insensitive).
pub fn mime_type_for(file_name: &str) -> &'static str {
    let lower = file_name.to_ascii_lowercase();
    const TABLE: &[(&str, &str)] = &[
        (".jpg", "image/jpeg"),
        (".jpeg", "image/jpeg"),
        (".png", "image/png"),
        (".pdf", "application/pdf"),
        (".mp4", "video/mp4"),
        (".txt", "text/plain"),
        (".mp3", "audio/mpeg"),
        (".apk", "application/vnd.android.package-archive"),
    ];
    TABLE
        .iter()
        .find(|(suffix, _)| lower.ends_with(suffix))
        .map(|(_, mime)| *mime)
        .unwrap_or("application/octet-stream")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn visible_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn commit_makes_file_visible() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::new(tmp.path()).unwrap();

        let mut staged = storage.stage("hello.txt").unwrap();
        staged.write_all(b"hello world").unwrap();
        assert!(staged.part_path().exists());

        let received = staged.commit().unwrap();
        assert_eq!(received.file_name, "hello.txt");
        assert_eq!(received.mime_type, "text/plain");
        assert_eq!(received.size, 11);
        assert_eq!(fs::read(&received.path).unwrap(), b"hello world");
        assert_eq!(visible_files(tmp.path()), vec!["hello.txt"]);
    }

    #[test]
    fn dropped_stage_leaves_nothing_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::new(tmp.path()).unwrap();

        let mut staged = storage.stage("secret.pdf").unwrap();
        staged.write_all(&[0u8; 100_000]).unwrap();
        drop(staged);

        assert!(visible_files(tmp.path()).is_empty());
    }

    #[test]
    fn name_collisions_get_a_counter() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::new(tmp.path()).unwrap();

        for _ in 0..3 {
            storage.stage("photo.jpg").unwrap().commit().unwrap();
        }
        assert_eq!(
            visible_files(tmp.path()),
            vec!["photo (1).jpg", "photo (2).jpg", "photo.jpg"]
        );
    }

    #[test]
    fn long_names_stage_and_keep_their_full_name() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::new(tmp.path()).unwrap();
        // Legal on common filesystems, too long once padded with a uuid.
        let name = format!("{}.txt", "a".repeat(230));

        let mut staged = storage.stage(&name).unwrap();
        staged.write_all(b"long").unwrap();
        let staged_name = staged.part_path().file_name().unwrap().len();
        assert!(staged_name < 100, "staging name is {} bytes", staged_name);

        let received = staged.commit().unwrap();
        assert_eq!(received.file_name, name);
        assert_eq!(visible_files(tmp.path()), vec![name]);
    }

    #[test]
    fn staging_prefix_respects_char_boundaries() {
        let name = "é".repeat(40);
        let prefix = name_prefix(&name);
        assert_eq!(prefix.len(), STAGING_NAME_PREFIX);
        assert_eq!(name_prefix("short.txt"), "short.txt");
        assert_eq!(name_prefix(&format!("a{}", name)).len(), STAGING_NAME_PREFIX - 1);
    }

    #[test]
    fn commit_never_replaces_a_file_that_appeared_meanwhile() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::new(tmp.path()).unwrap();

        let mut staged = storage.stage("report.txt").unwrap();
        staged.write_all(b"received").unwrap();
        // Someone else takes the name after staging started.
        fs::write(tmp.path().join("report.txt"), b"theirs").unwrap();

        let received = staged.commit().unwrap();
        assert_eq!(received.file_name, "report (1).txt");
        assert_eq!(fs::read(tmp.path().join("report.txt")).unwrap(), b"theirs");
        assert_eq!(fs::read(&received.path).unwrap(), b"received");
    }

    #[test]
    fn claims_hand_out_distinct_names() {
        let tmp = tempfile::tempdir().unwrap();
        let first = claim_unique_path(tmp.path(), "notes").unwrap();
        let second = claim_unique_path(tmp.path(), "notes").unwrap();
        assert_ne!(first, second);
        assert!(first.exists() && second.exists());
        assert_eq!(visible_files(tmp.path()), vec!["notes", "notes (1)"]);
    }

    #[test]
    fn creates_missing_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a").join("b");
        let storage = Storage::new(&nested).unwrap();
        assert!(storage.dir().is_dir());
    }

    #[test]
    fn peer_names_cannot_escape_the_directory() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\me\\notes.txt"), "notes.txt");
        assert_eq!(sanitize_file_name(".."), "received_file");
        assert_eq!(sanitize_file_name("dir/"), "received_file");
        assert_eq!(sanitize_file_name("  "), "received_file");
        assert_eq!(sanitize_file_name("a\u{0}b.txt"), "ab.txt");
    }

    #[test]
    fn mime_table() {
        assert_eq!(mime_type_for("IMG_001.JPG"), "image/jpeg");
        assert_eq!(mime_type_for("a.jpeg"), "image/jpeg");
        assert_eq!(mime_type_for("a.png"), "image/png");
        assert_eq!(mime_type_for("doc.pdf"), "application/pdf");
        assert_eq!(mime_type_for("clip.mp4"), "video/mp4");
        assert_eq!(mime_type_for("song.mp3"), "audio/mpeg");
        assert_eq!(mime_type_for("notes.txt"), "text/plain");
        assert_eq!(
            mime_type_for("app.apk"),
            "application/vnd.android.package-archive"
        );
        assert_eq!(mime_type_for("archive.tar.gz"), "application/octet-stream");
        assert_eq!(mime_type_for("txt"), "application/octet-stream");
    }
}
