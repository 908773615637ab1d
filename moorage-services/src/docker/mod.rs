//! Dockers: the backends requests are routed to.
use std::path::{Component, Path, PathBuf};

use moorage_core::error::HttpError;

mod cgi;
mod file;
mod warp;

pub use cgi::{CgiDocker, CgiSlots, Reaper};
pub use file::FileDocker;
pub use warp::WarpDocker;

/// Maps a request path onto a file under `root`. Paths climbing out of `root` are
/// refused.
pub(crate) fn resolve(root: &Path, uri_path: &str) -> Result<PathBuf, HttpError> {
    let mut path = root.to_path_buf();
    for component in Path::new(uri_path.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            _ => return Err(HttpError::bad_request(format!("invalid path {uri_path}"))),
        }
    }
    Ok(path)
}

pub(crate) fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("txt") => "text/plain; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js" | "mjs") => "text/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("ico") => "image/x-icon",
        Some("wasm") => "application/wasm",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_stays_under_root() {
        let root = Path::new("/srv/www");
        assert_eq!(
            resolve(root, "/a/./b.html").unwrap(),
            PathBuf::from("/srv/www/a/b.html")
        );
        assert_eq!(resolve(root, "/").unwrap(), PathBuf::from("/srv/www"));
        assert!(resolve(root, "/a/../../etc/passwd").is_err());
    }

    #[test]
    fn content_type_by_extension() {
        assert_eq!(content_type(Path::new("x/INDEX.HTML")), "text/html; charset=utf-8");
        assert_eq!(content_type(Path::new("x/blob")), "application/octet-stream");
    }
}
