//! Offline handshake cracking through aircrack-ng.
//!
//! Wordlist resolution tries the user's path, common extensions, the bundled
//! list and the usual rockyou locations; gzipped candidates are decompressed
//! into a temp file which is unlinked when the resolution handle drops.

use crate::{
    error::Error,
    exec::{argv, DefaultExec, Exec, ExecOptsBuilder},
};
use anyhow::{Context, Result};
use derive_builder::Builder;
use flate2::read::GzDecoder;
use log::{debug, info, warn};
use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;

/// The wordlist shipped with the toolkit.
const BUNDLED_WORDLIST: &str = "wordlist-top4800-probable.txt";
/// Well-known rockyou locations checked as a last resort.
const ROCKYOU_PATHS: &[&str] = &[
    "/usr/share/wordlists/rockyou.txt",
    "/usr/share/wordlists/rockyou.txt.gz",
    "/usr/share/wordlists/rockyou.gz",
];

/// A usable wordlist path. When the source was gzipped, the decompressed
/// temp file lives exactly as long as this handle.
#[derive(Debug)]
pub struct ResolvedWordlist {
    path: PathBuf,
    _decompressed: Option<NamedTempFile>,
}

impl ResolvedWordlist {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Builder, Clone, Debug)]
#[builder(default, pattern = "owned", setter(into))]
/// Resolves wordlists and drives aircrack-ng.
pub struct CrackingManager {
    #[builder(private, default = "Box::new(DefaultExec)")]
    exec: Box<dyn Exec>,

    #[builder(default = "\"wordlists\".into()")]
    /// Directory holding the bundled wordlists.
    wordlist_dir: PathBuf,
}

impl Default for CrackingManager {
    fn default() -> Self {
        Self {
            exec: Box::new(DefaultExec),
            wordlist_dir: "wordlists".into(),
        }
    }
}

impl CrackingManager {
    /// Resolve `user_path` to a readable, uncompressed wordlist.
    ///
    /// Candidates in order: the path as given, with `.txt`, with `.gz`, the
    /// bundled list (plain then gzipped), then the rockyou locations. Fails
    /// with [`Error::WordlistUnavailable`] when nothing usable is found.
    pub fn find_wordlist(&self, user_path: &str) -> Result<ResolvedWordlist> {
        let mut candidates: Vec<PathBuf> = vec![
            PathBuf::from(user_path),
            PathBuf::from(format!("{}.txt", user_path)),
            PathBuf::from(format!("{}.gz", user_path)),
            self.wordlist_dir.join(BUNDLED_WORDLIST),
            self.wordlist_dir.join(format!("{}.gz", BUNDLED_WORDLIST)),
        ];
        candidates.extend(ROCKYOU_PATHS.iter().map(PathBuf::from));

        let mut checked = Vec::new();
        for candidate in candidates {
            checked.push(candidate.display().to_string());
            if !candidate.is_file() {
                continue;
            }
            if candidate
                .extension()
                .map(|e| e.eq_ignore_ascii_case("gz"))
                .unwrap_or(false)
            {
                match decompress_to_temp(&candidate) {
                    Ok(Some(temp)) => {
                        debug!(
                            "Using wordlist {} (decompressed from {})",
                            temp.path().display(),
                            candidate.display()
                        );
                        return Ok(ResolvedWordlist {
                            path: temp.path().to_path_buf(),
                            _decompressed: Some(temp),
                        });
                    }
                    Ok(None) => {
                        warn!("Wordlist {} decompressed to nothing", candidate.display());
                        continue;
                    }
                    Err(e) => {
                        warn!("Could not decompress {}: {:#}", candidate.display(), e);
                        continue;
                    }
                }
            }
            if File::open(&candidate).is_err() {
                debug!("Skipping unreadable wordlist {}", candidate.display());
                continue;
            }
            debug!("Using wordlist {}", candidate.display());
            return Ok(ResolvedWordlist {
                path: candidate,
                _decompressed: None,
            });
        }

        Err(Error::WordlistUnavailable(format!("tried {}", checked.join(", "))).into())
    }

    /// Run aircrack-ng over `cap_path` with `wordlist` and extract the key
    /// from its `KEY FOUND!` report, if any.
    pub async fn crack(&self, cap_path: &Path, wordlist: &Path) -> Result<Option<String>> {
        info!(
            "Cracking {} with wordlist {}",
            cap_path.display(),
            wordlist.display()
        );
        // aircrack-ng exits non-zero when the key is not in the list; the
        // stdout scan below is the real classification.
        let stdout = self
            .exec
            .run(
                &argv([
                    "aircrack-ng",
                    "-w",
                    wordlist.to_string_lossy().as_ref(),
                    cap_path.to_string_lossy().as_ref(),
                ]),
                &ExecOptsBuilder::default().check(false).build()?,
            )
            .await
            .context("run aircrack-ng")?;

        match parse_key(&stdout) {
            Some(key) => {
                info!("Key recovered for {}", cap_path.display());
                Ok(Some(key))
            }
            None => {
                info!("Key not present in the wordlist");
                Ok(None)
            }
        }
    }
}

/// Extract the bracketed token from an aircrack `KEY FOUND!` line.
pub fn parse_key(stdout: &str) -> Option<String> {
    for line in stdout.lines() {
        if !line.contains("KEY FOUND!") {
            continue;
        }
        let open = line.find('[')?;
        let close = line[open..].find(']')? + open;
        let key = line[open + 1..close].trim();
        if !key.is_empty() {
            return Some(key.to_string());
        }
    }
    None
}

/// Decompress a gzipped wordlist into a temp file. `Ok(None)` means the
/// archive decompressed to an empty file and is unusable.
fn decompress_to_temp(gz_path: &Path) -> Result<Option<NamedTempFile>> {
    let file = File::open(gz_path).with_context(|| format!("open {}", gz_path.display()))?;
    let mut decoder = GzDecoder::new(file);
    let mut temp = tempfile::Builder::new()
        .prefix("wordlist_")
        .suffix(".txt")
        .tempfile()
        .context("create wordlist temp file")?;
    let written = io::copy(&mut decoder, temp.as_file_mut())
        .with_context(|| format!("decompress {}", gz_path.display()))?;
    if written == 0 {
        return Ok(None);
    }
    Ok(Some(temp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::tests::ExecMock;
    use flate2::{write::GzEncoder, Compression};
    use std::io::Write;
    use tempfile::TempDir;

    const KEY_FOUND_OUTPUT: &str = r#"
                               Aircrack-ng 1.7

      [00:00:02] 42/4800 keys tested (1718.26 k/s)

      Time left: 2 seconds                                     0.88%

                           KEY FOUND! [ hunter2 ]


      Master Key     : 9C 69 ...
"#;

    fn write_gz(path: &Path, contents: &[u8]) -> Result<()> {
        let file = File::create(path)?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(contents)?;
        encoder.finish()?;
        Ok(())
    }

    #[test]
    fn key_parsing() {
        assert_eq!(parse_key(KEY_FOUND_OUTPUT).as_deref(), Some("hunter2"));
        assert_eq!(
            parse_key("KEY FOUND! [ pass with spaces ]").as_deref(),
            Some("pass with spaces")
        );
        assert_eq!(parse_key("Passphrase not in dictionary"), None);
        assert_eq!(parse_key("KEY FOUND! [  ]"), None);
        assert_eq!(parse_key(""), None);
    }

    #[test]
    fn find_wordlist_prefers_exact_path() -> Result<()> {
        let dir = TempDir::new()?;
        let manager = CrackingManagerBuilder::default()
            .wordlist_dir(dir.path().join("none"))
            .build()?;

        let exact = dir.path().join("mylist");
        std::fs::write(&exact, "password\n")?;
        let resolved = manager.find_wordlist(&exact.to_string_lossy())?;
        assert_eq!(resolved.path(), exact.as_path());
        Ok(())
    }

    #[test]
    fn find_wordlist_txt_beats_gz() -> Result<()> {
        let dir = TempDir::new()?;
        let manager = CrackingManagerBuilder::default()
            .wordlist_dir(dir.path().join("none"))
            .build()?;

        let stem = dir.path().join("mylist");
        std::fs::write(dir.path().join("mylist.txt"), "password\n")?;
        write_gz(&dir.path().join("mylist.gz"), b"password\n")?;

        let resolved = manager.find_wordlist(&stem.to_string_lossy())?;
        assert!(resolved.path().to_string_lossy().ends_with("mylist.txt"));
        Ok(())
    }

    #[test]
    fn find_wordlist_decompresses_gz() -> Result<()> {
        let dir = TempDir::new()?;
        let manager = CrackingManagerBuilder::default()
            .wordlist_dir(dir.path().join("none"))
            .build()?;

        let stem = dir.path().join("packed");
        write_gz(&dir.path().join("packed.gz"), b"alpha\nbeta\n")?;

        let resolved = manager.find_wordlist(&stem.to_string_lossy())?;
        let contents = std::fs::read_to_string(resolved.path())?;
        assert_eq!(contents, "alpha\nbeta\n");

        // The temp file dies with the handle.
        let temp_path = resolved.path().to_path_buf();
        drop(resolved);
        assert!(!temp_path.exists());
        Ok(())
    }

    #[test]
    fn find_wordlist_falls_back_to_bundled() -> Result<()> {
        let dir = TempDir::new()?;
        std::fs::write(dir.path().join(BUNDLED_WORDLIST), "probable\n")?;
        let manager = CrackingManagerBuilder::default()
            .wordlist_dir(dir.path())
            .build()?;

        let resolved = manager.find_wordlist("/definitely/missing")?;
        assert!(resolved
            .path()
            .to_string_lossy()
            .ends_with(BUNDLED_WORDLIST));
        Ok(())
    }

    #[test]
    fn empty_gz_is_unavailable() -> Result<()> {
        let dir = TempDir::new()?;
        let manager = CrackingManagerBuilder::default()
            .wordlist_dir(dir.path().join("none"))
            .build()?;

        let stem = dir.path().join("empty");
        write_gz(&dir.path().join("empty.gz"), b"")?;

        let err = manager
            .find_wordlist(&stem.to_string_lossy())
            .expect_err("empty list is unusable");
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::WordlistUnavailable(_))
        ));
        Ok(())
    }

    #[test]
    fn resolution_is_stable_for_plain_files() -> Result<()> {
        let dir = TempDir::new()?;
        let manager = CrackingManagerBuilder::default()
            .wordlist_dir(dir.path().join("none"))
            .build()?;

        let exact = dir.path().join("stable.txt");
        std::fs::write(&exact, "password\n")?;

        let first = manager.find_wordlist(&exact.to_string_lossy())?;
        let second = manager.find_wordlist(&first.path().to_string_lossy())?;
        assert_eq!(first.path(), second.path());
        Ok(())
    }

    #[tokio::test]
    async fn crack_extracts_the_key() -> Result<()> {
        let mock = ExecMock::default();
        mock.push_ok(KEY_FOUND_OUTPUT);

        let manager = CrackingManagerBuilder::default()
            .exec(Box::new(mock.clone()) as Box<dyn Exec>)
            .build()?;
        let key = manager
            .crack(Path::new("/tmp/handshake-01.cap"), Path::new("/tmp/list.txt"))
            .await?;
        assert_eq!(key.as_deref(), Some("hunter2"));

        assert_eq!(
            mock.joined_calls()[0],
            "aircrack-ng -w /tmp/list.txt /tmp/handshake-01.cap"
        );
        Ok(())
    }

    #[tokio::test]
    async fn crack_returns_none_without_key() -> Result<()> {
        let mock = ExecMock::default();
        mock.push_ok("Passphrase not in dictionary");

        let manager = CrackingManagerBuilder::default()
            .exec(Box::new(mock) as Box<dyn Exec>)
            .build()?;
        let key = manager
            .crack(Path::new("/tmp/handshake-01.cap"), Path::new("/tmp/list.txt"))
            .await?;
        assert!(key.is_none());
        Ok(())
    }
}
