//! Replace the 18th line of a source file with a fixed block of imports.

pub mod lines {
    /// Zero-based index of the line that gets replaced.
    pub const TARGET_LINE: usize = 17;

    /// The imports written in place of the target line.
    pub const REPLACEMENT_BLOCK: &str = "import PSQICard from './PSQICard'\n\
                                         import EPS10Card from './EPS10Card'\n\
                                         import { ExportButton } from './ExportButton'\n";

    /// Split `contents` into lines, each keeping its terminator.
    ///
    /// Concatenating the result gives back `contents` byte for byte. A `\r\n`
    /// terminator stays attached to its line, and the last line has no
    /// terminator if the file doesn't end with one.
    pub fn split_lines(contents: &str) -> Vec<&str> {
        contents.split_inclusive('\n').collect()
    }

}


pub mod patch {
    use std::{
        fs::{self, File, Metadata, OpenOptions},
        io::{self, Write},
        path::{Path, PathBuf},
    };

    use tempfile::NamedTempFile;
    use thiserror::Error;
    use tracing::{debug, info, warn};
    use tracing_attributes::instrument;

    use crate::lines::{REPLACEMENT_BLOCK, TARGET_LINE, split_lines};

    /// What happened to the target line.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum PatchOutcome {
        /// The target line existed and was replaced by the import block.
        Replaced {
            /// The discarded line, terminator included.
            original_line: String,
        },
        /// The file is too short to have a target line; content is unchanged.
        Unchanged { line_count: usize },
    }

    #[derive(Debug, Error)]
    pub enum PatchError {
        #[error("failed to read `{}`: {source}", path.display())]
        Read {
            path: PathBuf,
            #[source]
            source: io::Error,
        },
        #[error("failed to write the new contents of `{}`: {source}", path.display())]
        Write {
            path: PathBuf,
            #[source]
            source: io::Error,
        },
        #[error("failed to replace `{}`: {source}", path.display())]
        Persist {
            path: PathBuf,
            #[source]
            source: tempfile::PersistError,
        },
    }

    /// Replace the target line in place, if there is one.
    pub fn patch_lines(lines: &mut [&str]) -> PatchOutcome {
        match lines.get_mut(TARGET_LINE) {
            Some(line) => PatchOutcome::Replaced {
                original_line: std::mem::replace(line, REPLACEMENT_BLOCK).to_owned(),
            },
            None => PatchOutcome::Unchanged {
                line_count: lines.len(),
            },
        }
    }

    /// Patch a whole file's contents, returning the new contents.
    pub fn patch_contents(contents: &str) -> (String, PatchOutcome) {
        let mut lines = split_lines(contents);
        let outcome = patch_lines(&mut lines);
        (lines.concat(), outcome)
    }

    /// Read `path`, patch it and write it back.
    ///
    /// The file is rewritten even when it is too short to be patched. The new
    /// contents go to a temporary file next to the target, which is then
    /// renamed over it, so a failed write leaves the original intact. Files
    /// with other hard links, and files in a directory where no temporary
    /// file can be created, are rewritten in place instead.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub fn patch_file(path: &Path) -> Result<PatchOutcome, PatchError> {
        let read_error = |source| PatchError::Read {
            path: path.to_path_buf(),
            source,
        };
        let write_error = |source| PatchError::Write {
            path: path.to_path_buf(),
            source,
        };
        let contents = fs::read_to_string(path).map_err(read_error)?;
        // Follow symlinks so the rename replaces the file, not the link.
        let target = fs::canonicalize(path).map_err(read_error)?;
        let metadata = fs::metadata(&target).map_err(read_error)?;
        // The rename would bypass the file's own permissions.
        OpenOptions::new()
            .write(true)
            .open(&target)
            .map_err(write_error)?;

        let (patched, outcome) = patch_contents(&contents);
        match &outcome {
            PatchOutcome::Replaced { original_line } => {
                info!(original_line = original_line.trim_end(), "replaced line 18")
            }
            PatchOutcome::Unchanged { line_count } => {
                debug!(line_count, "file too short, nothing to replace")
            }
        }

        write_back(&target, &patched, &metadata).map_err(|err| match err {
            WriteBackError::Write(source) => write_error(source),
            WriteBackError::Persist(source) => PatchError::Persist {
                path: path.to_path_buf(),
                source,
            },
        })?;
        Ok(outcome)
    }

    #[derive(Debug)]
    enum WriteBackError {
        Write(io::Error),
        Persist(tempfile::PersistError),
    }

    fn write_back(target: &Path, contents: &str, metadata: &Metadata) -> Result<(), WriteBackError> {
        if has_other_links(metadata) {
            warn!("file has other hard links, rewriting in place");
            return write_in_place(target, contents).map_err(WriteBackError::Write);
        }
        let dir = target.parent().unwrap_or_else(|| Path::new("."));
        let file = match NamedTempFile::new_in(dir) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                warn!(dir = %dir.display(), %err, "no temporary file possible, rewriting in place");
                return write_in_place(target, contents).map_err(WriteBackError::Write);
            }
            Err(err) => return Err(WriteBackError::Write(err)),
        };
        replace_with(file, target, contents, metadata)
    }

    fn replace_with(
        mut file: NamedTempFile,
        target: &Path,
        contents: &str,
        metadata: &Metadata,
    ) -> Result<(), WriteBackError> {
        file.write_all(contents.as_bytes())
            .map_err(WriteBackError::Write)?;
        // Before the mode: changing the owner can clear setuid bits.
        copy_owner(file.as_file(), metadata);
        file.as_file()
            .set_permissions(metadata.permissions())
            .map_err(WriteBackError::Write)?;
        file.as_file().sync_all().map_err(WriteBackError::Write)?;
        debug!(temp = %file.path().display(), "renaming over target");
        file.persist(target).map_err(WriteBackError::Persist)?;
        Ok(())
    }

    /// Truncate and rewrite. A failure halfway leaves a partial file.
    fn write_in_place(target: &Path, contents: &str) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(target)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()
    }

    #[cfg(unix)]
    fn has_other_links(metadata: &Metadata) -> bool {
        use std::os::unix::fs::MetadataExt;
        metadata.nlink() > 1
    }

    #[cfg(not(unix))]
    fn has_other_links(_metadata: &Metadata) -> bool {
        false
    }

    /// Give the temporary file the target's owner and group.
    #[cfg(unix)]
    fn copy_owner(file: &File, metadata: &Metadata) {
        use std::os::unix::fs::{MetadataExt, fchown};

        let owner = (metadata.uid(), metadata.gid());
        match file.metadata() {
            Ok(current) if (current.uid(), current.gid()) == owner => {}
            _ => {
                if let Err(err) = fchown(file, Some(owner.0), Some(owner.1)) {
                    warn!(%err, uid = owner.0, gid = owner.1, "could not keep the file owner");
                }
            }
        }
    }

    #[cfg(not(unix))]
    fn copy_owner(_file: &File, _metadata: &Metadata) {}

    #[cfg(test)]
    mod tests {
        use super::*;
        use pretty_assertions::assert_eq;
        use tempfile::TempDir;

        fn numbered(count: usize) -> String {
            (1..=count).map(|n| format!("line {n}\n")).collect()
        }

        #[test]
        fn short_contents_are_unchanged() {
            let contents = numbered(17);
            let (patched, outcome) = patch_contents(&contents);
            assert_eq!(patched, contents);
            assert_eq!(outcome, PatchOutcome::Unchanged { line_count: 17 });
        }

        #[test]
        fn eighteenth_line_is_replaced() {
            let (patched, outcome) = patch_contents(&numbered(20));
            let lines = split_lines(&patched);
            assert_eq!(lines.len(), 22);
            assert_eq!(lines[16], "line 17\n");
            assert_eq!(lines[17..20].concat(), REPLACEMENT_BLOCK);
            assert_eq!(lines[20], "line 19\n");
            assert_eq!(lines[21], "line 20\n");
            assert_eq!(
                outcome,
                PatchOutcome::Replaced {
                    original_line: "line 18\n".to_owned()
                }
            );
        }

        #[test]
        fn last_line_without_newline_is_replaced() {
            let contents = numbered(17) + "line 18";
            let (patched, _) = patch_contents(&contents);
            assert_eq!(patched, numbered(17) + REPLACEMENT_BLOCK);
            assert_eq!(split_lines(&patched).len(), 20);
        }

        #[test]
        fn second_pass_inserts_the_block_again() {
            let (once, _) = patch_contents(&numbered(25));
            let (twice, outcome) = patch_contents(&once);
            let once_lines = split_lines(&once);
            let twice_lines = split_lines(&twice);
            assert_eq!(twice_lines.len(), once_lines.len() + 2);
            assert_eq!(&twice_lines[..17], &once_lines[..17]);
            assert_eq!(twice_lines[17..20].concat(), REPLACEMENT_BLOCK);
            assert_eq!(&twice_lines[20..], &once_lines[18..]);
            assert_eq!(twice_lines[20], "import EPS10Card from './EPS10Card'\n");
            assert_eq!(
                outcome,
                PatchOutcome::Replaced {
                    original_line: "import PSQICard from './PSQICard'\n".to_owned()
                }
            );
        }

        #[test]
        fn crlf_lines_around_the_target_are_kept() {
            let contents: String = (1..=19).map(|n| format!("line {n}\r\n")).collect();
            let (patched, _) = patch_contents(&contents);
            let lines = split_lines(&patched);
            assert_eq!(lines[16], "line 17\r\n");
            assert_eq!(lines[20], "line 19\r\n");
        }

        #[test]
        fn write_back_into_a_missing_directory_is_a_write_error() {
            let dir = TempDir::new().unwrap();
            let source = dir.path().join("Dashboard.tsx");
            fs::write(&source, numbered(3)).unwrap();
            let metadata = fs::metadata(&source).unwrap();
            let target = dir.path().join("missing").join("Dashboard.tsx");

            let err = write_back(&target, "patched\n", &metadata).unwrap_err();

            assert!(
                matches!(&err, WriteBackError::Write(source) if source.kind() == io::ErrorKind::NotFound),
                "unexpected error: {err:?}"
            );
            assert!(!target.exists());
        }

        #[test]
        fn failed_rename_is_a_persist_error_and_cleans_up() {
            let dir = TempDir::new().unwrap();
            let source = dir.path().join("Dashboard.tsx");
            fs::write(&source, numbered(3)).unwrap();
            let metadata = fs::metadata(&source).unwrap();
            // A non-empty directory cannot be renamed over.
            let target = dir.path().join("components");
            fs::create_dir(&target).unwrap();
            fs::write(target.join("Card.tsx"), numbered(2)).unwrap();

            let err = write_back(&target, "patched\n", &metadata).unwrap_err();

            assert!(matches!(err, WriteBackError::Persist(_)), "unexpected error: {err:?}");
            let mut names: Vec<String> = fs::read_dir(dir.path())
                .unwrap()
                .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            assert_eq!(names, vec!["Dashboard.tsx".to_owned(), "components".to_owned()]);
        }
    }
}
