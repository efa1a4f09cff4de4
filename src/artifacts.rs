//! On-disk artifacts for a new host
//!
//! Each context host owns a config directory, a work directory and a
//! descriptor file inside the config directory declaring its document root.
//! Writing is best-effort: failures are logged and reported back, never
//! propagated, so a half-provisioned host can still be redirected to.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// File name of the descriptor inside a host's config directory
pub const DESCRIPTOR_FILE_NAME: &str = "ROOT.xml";

/// Where the runtime keeps per-host config and work directories
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostLayout {
    base_dir: PathBuf,
    engine_name: String,
}

/// Artifact paths for one context host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub config_dir: PathBuf,
    pub work_dir: PathBuf,
    pub descriptor: PathBuf,
}

impl HostLayout {
    pub fn new(base_dir: impl Into<PathBuf>, engine_name: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.into(),
            engine_name: engine_name.into(),
        }
    }

    /// Whether `host` names exactly one directory below the engine directory.
    ///
    /// Rejects empty names, `.`, `..` and anything containing a separator.
    pub fn is_host_segment(host: &str) -> bool {
        let mut components = Path::new(host).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) => name == std::ffi::OsStr::new(host),
            _ => false,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn config_dir(&self, host: &str) -> PathBuf {
        self.base_dir.join("conf").join(&self.engine_name).join(host)
    }

    pub fn work_dir(&self, host: &str) -> PathBuf {
        self.base_dir.join("work").join(&self.engine_name).join(host)
    }

    pub fn paths(&self, host: &str) -> ArtifactPaths {
        let config_dir = self.config_dir(host);
        let descriptor = config_dir.join(DESCRIPTOR_FILE_NAME);
        ArtifactPaths {
            work_dir: self.work_dir(host),
            config_dir,
            descriptor,
        }
    }
}

/// A filesystem step that failed during [`ArtifactWriter::prepare`]
#[derive(Debug)]
pub struct ArtifactFailure {
    pub step: &'static str,
    pub path: PathBuf,
    pub error: io::Error,
}

/// What [`ArtifactWriter::prepare`] did
#[derive(Debug, Default)]
pub struct ArtifactReport {
    pub removed_stale_config: bool,
    pub removed_stale_work: bool,
    pub descriptor_written: bool,
    pub failures: Vec<ArtifactFailure>,
}

impl ArtifactReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn fail(&mut self, step: &'static str, path: &Path, error: io::Error) {
        warn!(step, path = %path.display(), error = %error, "Artifact step failed");
        self.failures.push(ArtifactFailure {
            step,
            path: path.to_path_buf(),
            error,
        });
    }
}

pub struct ArtifactWriter {
    layout: HostLayout,
    scan_dependency_paths: bool,
}

impl ArtifactWriter {
    pub fn new(layout: HostLayout, scan_dependency_paths: bool) -> Self {
        Self {
            layout,
            scan_dependency_paths,
        }
    }

    pub fn layout(&self) -> &HostLayout {
        &self.layout
    }

    /// Lay down fresh artifacts for a new context host.
    ///
    /// A leftover config directory is wiped and recreated empty and a
    /// leftover work directory is removed, since either may belong to an
    /// earlier, differently configured deployment. The work directory is
    /// recreated by the runtime once it deploys the descriptor.
    pub fn prepare(&self, context_host: &str, doc_root: &Path) -> ArtifactReport {
        let mut report = ArtifactReport::default();
        if !HostLayout::is_host_segment(context_host) {
            report.fail(
                "validate_host",
                Path::new(context_host),
                io::Error::new(io::ErrorKind::InvalidInput, "host is not a single path segment"),
            );
            return report;
        }
        let paths = self.layout.paths(context_host);

        if paths.config_dir.is_dir() {
            debug!(path = %paths.config_dir.display(), "Removing stale config directory");
            match remove_dir_all_best_effort(&paths.config_dir) {
                Ok(()) => report.removed_stale_config = true,
                Err(e) => report.fail("remove_config_dir", &paths.config_dir, e),
            }
        }
        if let Err(e) = fs::create_dir_all(&paths.config_dir) {
            report.fail("create_config_dir", &paths.config_dir, e);
        }

        if paths.work_dir.is_dir() {
            debug!(path = %paths.work_dir.display(), "Removing stale work directory");
            match remove_dir_all_best_effort(&paths.work_dir) {
                Ok(()) => report.removed_stale_work = true,
                Err(e) => report.fail("remove_work_dir", &paths.work_dir, e),
            }
        }

        let contents = render_descriptor(doc_root, self.scan_dependency_paths);
        match write_if_absent(&paths.descriptor, &contents) {
            Ok(written) => report.descriptor_written = written,
            Err(e) => report.fail("write_descriptor", &paths.descriptor, e),
        }

        report
    }
}

/// Write `contents` to `path` unless the file already exists.
///
/// Returns `Ok(false)` when an existing file was left alone.
fn write_if_absent(path: &Path, contents: &str) -> io::Result<bool> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(e),
    };
    file.write_all(contents.as_bytes())?;
    file.sync_all()?;
    Ok(true)
}

/// Render the descriptor declaring `doc_root` as the host's document root
pub fn render_descriptor(doc_root: &Path, scan_dependency_paths: bool) -> String {
    let mut out = String::new();
    out.push_str("<?xml version='1.0' encoding='utf-8'?>\n");
    out.push_str(&format!(
        "<Context docBase=\"{}\">\n",
        html_escape::encode_double_quoted_attribute(&doc_root.to_string_lossy())
    ));
    if !scan_dependency_paths {
        out.push_str("  <JarScanner scanClassPath=\"false\" scanManifest=\"false\"/>\n");
    }
    out.push_str("  <WatchedResource>WEB-INF/web.xml</WatchedResource>\n");
    out.push_str("</Context>\n");
    out
}

/// Extract the document root from the descriptor's `<Context>` start tag
pub fn parse_doc_base(contents: &str) -> Option<String> {
    const ATTR: &str = "docBase=\"";
    let tag = context_start_tag(contents)?;
    let start = tag
        .match_indices(ATTR)
        .map(|(idx, _)| idx)
        .find(|&idx| tag[..idx].ends_with(char::is_whitespace))?
        + ATTR.len();
    let end = tag[start..].find('"')?;
    Some(html_escape::decode_html_entities(&tag[start..start + end]).into_owned())
}

/// The attributes of the first `<Context>` start tag
fn context_start_tag(contents: &str) -> Option<&str> {
    const OPEN: &str = "<Context";
    let mut offset = 0;
    while let Some(found) = contents[offset..].find(OPEN) {
        let after = offset + found + OPEN.len();
        let rest = &contents[after..];
        if rest.starts_with(|c: char| c.is_whitespace() || c == '>' || c == '/') {
            return rest.find('>').map(|end| &rest[..end]);
        }
        offset = after;
    }
    None
}

/// Recursively delete `path`, children first.
///
/// Every entry is attempted even after a failure; the first error is
/// returned once the walk completes. A missing path is not an error.
pub fn remove_dir_all_best_effort(path: &Path) -> io::Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    if !metadata.is_dir() {
        return fs::remove_file(path);
    }

    let mut first_error = None;
    for entry in fs::read_dir(path)? {
        let result = entry.and_then(|entry| remove_dir_all_best_effort(&entry.path()));
        if let Err(e) = result {
            first_error.get_or_insert(e);
        }
    }

    if let Some(e) = first_error {
        return Err(e);
    }
    fs::remove_dir(path)
}
