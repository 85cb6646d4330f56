//! Lazy bounded recursive directory traversal.
//!
//! The scanner walks the backup root in sections: each call collects up
//! to `max_paths` regular-file paths (with sizes) and stops, holding the
//! traversal iterator so the next section resumes where the previous one
//! ended. A section of zero paths signals end of traversal.
//!
//! All scanner methods run on the Disk strand; the struct itself is
//! plain synchronous state.

use std::path::PathBuf;

use walkdir::WalkDir;

pub struct FilesystemScanner {
    iterator: Option<walkdir::IntoIter>,
    paths_with_size: Vec<(PathBuf, u64)>,
}

impl FilesystemScanner {
    pub fn new() -> Self {
        Self {
            iterator: None,
            paths_with_size: Vec::new(),
        }
    }

    /// Begin a fresh traversal from `root` and collect the first
    /// section.
    pub fn start_scan(&mut self, root: &std::path::Path, max_paths: usize) {
        self.clear_paths();
        self.iterator = Some(WalkDir::new(root).follow_links(false).into_iter());
        self.continue_scan(max_paths);
    }

    /// Resume the traversal for another section of up to `max_paths`
    /// regular files.
    pub fn continue_scan(&mut self, max_paths: usize) {
        let iterator = match self.iterator.as_mut() {
            Some(iterator) => iterator,
            None => return,
        };

        let initial = self.paths_with_size.len();
        while self.paths_with_size.len() - initial < max_paths {
            match iterator.next() {
                Some(Ok(entry)) => {
                    if !entry.file_type().is_file() {
                        continue;
                    }
                    let size = match entry.metadata() {
                        Ok(metadata) => metadata.len(),
                        Err(err) => {
                            log::warn!(
                                "skipping {:?} - unable to stat: {}",
                                entry.path(),
                                err
                            );
                            continue;
                        }
                    };
                    self.paths_with_size.push((entry.into_path(), size));
                }
                Some(Err(err)) => {
                    log::warn!("error during filesystem scan: {}", err);
                }
                None => {
                    self.iterator = None;
                    break;
                }
            }
        }
    }

    /// The accumulated section.
    pub fn get_paths_with_size(&self) -> &[(PathBuf, u64)] {
        &self.paths_with_size
    }

    /// The accumulated section, paths only.
    pub fn get_paths(&self) -> Vec<PathBuf> {
        self.paths_with_size
            .iter()
            .map(|(path, _)| path.clone())
            .collect()
    }

    pub fn clear_paths(&mut self) {
        self.paths_with_size.clear();
    }
}

impl Default for FilesystemScanner {
    fn default() -> Self {
        Self::new()
    }
}
