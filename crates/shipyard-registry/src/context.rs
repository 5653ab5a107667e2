//! Build context archives.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use shipyard_core::{Error, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Rules from a `.dockerignore` file.
///
/// Every pattern excludes the matching path and everything beneath it.
/// Lines starting with `!` re-include paths.
#[derive(Debug, Clone)]
pub struct DockerIgnore {
    excludes: GlobSet,
    includes: GlobSet,
}

impl Default for DockerIgnore {
    fn default() -> Self {
        Self {
            excludes: GlobSet::empty(),
            includes: GlobSet::empty(),
        }
    }
}

impl DockerIgnore {
    /// Read `.dockerignore` from the context root, if present.
    pub fn load(context: &Path) -> Result<Self> {
        match std::fs::read_to_string(context.join(".dockerignore")) {
            Ok(content) => Self::parse(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(Error::Registry(format!("failed to read .dockerignore: {}", e))),
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut excludes = GlobSetBuilder::new();
        let mut includes = GlobSetBuilder::new();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (builder, pattern) = match line.strip_prefix('!') {
                Some(rest) => (&mut includes, rest),
                None => (&mut excludes, line),
            };
            let pattern = pattern
                .trim_start_matches("./")
                .trim_start_matches('/')
                .trim_end_matches('/');
            if pattern.is_empty() {
                continue;
            }
            builder.add(compile(pattern)?);
            builder.add(compile(&format!("{}/**", pattern))?);
        }

        let build = |b: GlobSetBuilder| {
            b.build()
                .map_err(|e| Error::Registry(format!("invalid .dockerignore: {}", e)))
        };
        Ok(Self {
            excludes: build(excludes)?,
            includes: build(includes)?,
        })
    }

    /// Whether a path relative to the context root is left out.
    pub fn is_ignored(&self, relative: &Path) -> bool {
        self.excludes.is_match(relative) && !self.includes.is_match(relative)
    }
}

fn compile(pattern: &str) -> Result<globset::Glob> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map_err(|e| Error::Registry(format!("invalid .dockerignore pattern '{}': {}", pattern, e)))
}

/// [`archive_context`] on the blocking pool, for use from async code.
pub async fn archive_context_blocking(context: PathBuf, dockerfile: String) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || archive_context(&context, &dockerfile))
        .await
        .map_err(|e| Error::Internal(format!("build context archiving panicked: {}", e)))?
}

/// Tar the context directory for the Docker build API.
///
/// The Dockerfile is always included so the daemon can find it even when
/// `.dockerignore` names it.
pub fn archive_context(context: &Path, dockerfile: &str) -> Result<Vec<u8>> {
    if !context.is_dir() {
        return Err(Error::Registry(format!(
            "build context {} is not a directory",
            context.display()
        )));
    }

    let ignore = DockerIgnore::load(context)?;
    let dockerfile = Path::new(dockerfile);

    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    builder.mode(tar::HeaderMode::Deterministic);

    let entries = WalkDir::new(context)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            let relative = entry.path().strip_prefix(context).unwrap_or(entry.path());
            // Directories are only pruned when nothing could re-include their contents.
            !(entry.file_type().is_dir()
                && ignore.includes.is_empty()
                && ignore.is_ignored(relative))
        });

    let mut count = 0usize;
    for entry in entries {
        let entry = entry.map_err(|e| Error::Registry(format!("failed to walk context: {}", e)))?;
        let relative = entry
            .path()
            .strip_prefix(context)
            .map_err(|e| Error::Internal(e.to_string()))?;

        if ignore.is_ignored(relative) && relative != dockerfile {
            continue;
        }

        let appended = if entry.file_type().is_dir() {
            builder.append_dir(relative, entry.path())
        } else {
            builder.append_path_with_name(entry.path(), relative)
        };
        appended.map_err(|e| {
            Error::Registry(format!("failed to add {} to context: {}", relative.display(), e))
        })?;
        count += 1;
    }

    tracing::debug!(context = %context.display(), entries = count, "Archived build context");

    builder
        .into_inner()
        .map_err(|e| Error::Registry(format!("failed to finish context archive: {}", e)))
}
