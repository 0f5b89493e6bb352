//! Lexical path utilities and the component iterator used by the secure
//! creator to walk a path one directory at a time.

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path {0:?} is not absolute")]
    NotAbsolute(PathBuf),
    #[error("path {0:?} is not clean")]
    NotClean(PathBuf),
    #[error("path {0:?} is not valid unicode")]
    NotUnicode(PathBuf),
}

/// Lexically normalizes a path: collapses repeated separators, removes `.`
/// components and resolves `..` components without consulting the
/// filesystem. Rooted `..` components are clamped at `/`.
pub fn clean(path: &Path) -> PathBuf {
    let absolute = path.is_absolute();
    let mut parts: Vec<&OsStr> = Vec::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                if let Some(last) = parts.last() {
                    if *last != OsStr::new("..") {
                        parts.pop();
                        continue;
                    }
                }
                if !absolute {
                    parts.push(OsStr::new(".."));
                }
            }
            Component::Normal(name) => parts.push(name),
        }
    }
    let mut result = if absolute {
        PathBuf::from("/")
    } else {
        PathBuf::new()
    };
    for part in parts {
        result.push(part);
    }
    if result.as_os_str().is_empty() {
        result.push(".");
    }
    result
}

/// True when the path is already in its cleaned form. Note that this is a
/// byte comparison, a trailing slash makes a path unclean even though the
/// component view would be identical.
pub fn is_clean(path: &Path) -> bool {
    path.as_os_str() == clean(path).as_os_str()
}

/// Ensures that a path is absolute and clean, the precondition of every
/// secure creator operation.
pub fn validate(path: &Path) -> Result<(), PathError> {
    if !path.is_absolute() {
        return Err(PathError::NotAbsolute(path.to_path_buf()));
    }
    if !is_clean(path) {
        return Err(PathError::NotClean(path.to_path_buf()));
    }
    Ok(())
}

/// One step of a path walk: the directory walked so far, the next component
/// and the path including that component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub base: PathBuf,
    pub name: String,
    pub path: PathBuf,
}

/// Iterates over the components of an absolute, clean path, yielding one
/// [`Segment`] per component. The root directory itself is not yielded, a
/// walk starts from an already opened `/`.
pub struct PathIterator {
    segments: Vec<Segment>,
    next: usize,
}

impl PathIterator {
    pub fn new(path: &Path) -> Result<Self, PathError> {
        validate(path)?;
        let mut segments = Vec::new();
        let mut base = PathBuf::from("/");
        for component in path.components() {
            if let Component::Normal(name) = component {
                let name = name
                    .to_str()
                    .ok_or_else(|| PathError::NotUnicode(path.to_path_buf()))?
                    .to_string();
                let path = base.join(&name);
                segments.push(Segment {
                    base: base.clone(),
                    name,
                    path: path.clone(),
                });
                base = path;
            }
        }
        Ok(PathIterator { segments, next: 0 })
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

impl Iterator for PathIterator {
    type Item = Segment;

    fn next(&mut self) -> Option<Segment> {
        let segment = self.segments.get(self.next)?.clone();
        self.next += 1;
        Some(segment)
    }
}
