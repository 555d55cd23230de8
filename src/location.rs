//! Storage location URIs.
//!
//! Two literal forms are accepted:
//!
//! - `s3://<bucket>/<key-or-prefix>`: bucket required, path optional (empty means bucket root)
//! - `file://<path>`: the remainder after `://` is taken verbatim, so `file://./data/`,
//!   `file:///var/archives/out.zip` and `file://relative/dir/` all work
//!
//! Everything here is pure string handling; no I/O.

use crate::error::{Error, Result};
use std::fmt;

const SCHEME_DELIMITER: &str = "://";

/// Storage backend addressed by a location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Local filesystem (`file://`)
    Filesystem,
    /// S3-compatible object store (`s3://`)
    ObjectStore,
}

impl Scheme {
    /// URI scheme prefix without the delimiter
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Filesystem => "file",
            Scheme::ObjectStore => "s3",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix.to_ascii_lowercase().as_str() {
            "file" => Some(Scheme::Filesystem),
            "s3" => Some(Scheme::ObjectStore),
            _ => None,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed storage location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLocation {
    pub scheme: Scheme,
    /// Bucket name for object stores; empty for filesystem locations
    pub container: String,
    /// Key or key prefix for object stores; the verbatim path for filesystem locations
    pub path: String,
}

impl ParsedLocation {
    /// Parse a location string. See [`parse`].
    pub fn parse(uri: &str) -> Result<Self> {
        parse(uri)
    }

    /// Directory part of `path`, up to and including the last `/`
    pub fn directory(&self) -> &str {
        directory_of(&self.path)
    }

    /// Remainder of `path` after the last `/`
    pub fn filename(&self) -> &str {
        filename_of(&self.path)
    }

    /// Join path segments onto this location, keeping scheme and container.
    pub fn join<S: AsRef<str>>(&self, segments: &[S]) -> Self {
        join(self, segments)
    }

    /// The `(container, key)` pair a storage provider is addressed with.
    ///
    /// Object stores use the bucket and the full path. Filesystem locations carry no
    /// container, so the directory part of the path becomes the container and the
    /// remainder is the key (or key prefix when listing).
    pub fn storage_pair(&self) -> (String, String) {
        match self.scheme {
            Scheme::ObjectStore => (self.container.clone(), self.path.clone()),
            Scheme::Filesystem => (
                directory_of(&self.path).to_string(),
                filename_of(&self.path).to_string(),
            ),
        }
    }
}

impl fmt::Display for ParsedLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme {
            Scheme::ObjectStore if self.path.is_empty() => {
                write!(f, "{}{}{}", self.scheme, SCHEME_DELIMITER, self.container)
            }
            Scheme::ObjectStore => write!(
                f,
                "{}{}{}/{}",
                self.scheme, SCHEME_DELIMITER, self.container, self.path
            ),
            Scheme::Filesystem => write!(f, "{}{}{}", self.scheme, SCHEME_DELIMITER, self.path),
        }
    }
}

/// Parse a location string into scheme, container and path.
///
/// Fails with [`Error::Configuration`] when the input is empty, the scheme is missing or
/// unsupported, an `s3://` location has no bucket, or a `file://` location has no path.
pub fn parse(uri: &str) -> Result<ParsedLocation> {
    let uri = uri.trim();
    if uri.is_empty() {
        return Err(Error::Configuration("location is empty".to_string()));
    }

    let (prefix, rest) = uri.split_once(SCHEME_DELIMITER).ok_or_else(|| {
        Error::Configuration(format!(
            "location '{}' has no scheme (expected file:// or s3://)",
            uri
        ))
    })?;

    let scheme = Scheme::from_prefix(prefix).ok_or_else(|| {
        Error::Configuration(format!("unsupported location scheme '{}'", prefix))
    })?;

    match scheme {
        Scheme::Filesystem => {
            if rest.is_empty() {
                return Err(Error::Configuration(format!(
                    "filesystem location '{}' has an empty path",
                    uri
                )));
            }
            Ok(ParsedLocation {
                scheme,
                container: String::new(),
                path: rest.to_string(),
            })
        }
        Scheme::ObjectStore => {
            let (container, path) = rest.split_once('/').unwrap_or((rest, ""));
            if container.is_empty() {
                return Err(Error::Configuration(format!(
                    "object store location '{}' is missing a bucket",
                    uri
                )));
            }
            Ok(ParsedLocation {
                scheme,
                container: container.to_string(),
                path: path.to_string(),
            })
        }
    }
}

/// Portion of `path` up to and including the last `/` (empty if there is none).
pub fn directory_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..=idx],
        None => "",
    }
}

/// Portion of `path` after the last `/` (the whole path if there is none).
pub fn filename_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Concatenate path segments onto `base.path` with exactly one `/` at each joint.
///
/// Empty segments are skipped. A leading `./` or `/` on the base path is preserved.
pub fn join<S: AsRef<str>>(base: &ParsedLocation, segments: &[S]) -> ParsedLocation {
    let mut path = base.path.clone();
    for segment in segments {
        let segment = segment.as_ref();
        if segment.trim_matches('/').is_empty() {
            continue;
        }
        if path.is_empty() {
            path.push_str(segment.trim_start_matches('/'));
        } else {
            path.truncate(path.trim_end_matches('/').len());
            path.push('/');
            path.push_str(segment.trim_start_matches('/'));
        }
    }

    ParsedLocation {
        scheme: base.scheme,
        container: base.container.clone(),
        path,
    }
}
