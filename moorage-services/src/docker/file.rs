use std::{fs::File, path::PathBuf};

use http::{
    header::{CONTENT_LENGTH, CONTENT_TYPE},
    HeaderValue, Method, StatusCode,
};
use moorage_core::{
    agent::{Docker, Harbor},
    error::HttpError,
    ship::SendFileShip,
    tour::{Consumer, TourId, TourKey},
    transporter::Timeouts,
};
use tracing::debug;

use super::{content_type, resolve};

const INDEX_FILE: &str = "index.html";

/// Serves files under a root directory.
#[derive(Debug, Clone)]
pub struct FileDocker {
    root: PathBuf,
    timeouts: Timeouts,
}

impl FileDocker {
    pub fn new(root: impl Into<PathBuf>, timeouts: Timeouts) -> Self {
        Self {
            root: root.into(),
            timeouts,
        }
    }

    fn open(&self, uri_path: &str) -> Result<(PathBuf, File, u64), HttpError> {
        let mut path = resolve(&self.root, uri_path)?;
        let not_found = |_| HttpError::not_found(format!("{uri_path} not found"));
        let mut meta = std::fs::metadata(&path).map_err(not_found)?;
        if meta.is_dir() {
            path.push(INDEX_FILE);
            meta = std::fs::metadata(&path).map_err(not_found)?;
        }
        if !meta.is_file() {
            return Err(HttpError::not_found(format!("{uri_path} not found")));
        }
        let file = File::open(&path).map_err(|e| {
            HttpError::new(StatusCode::FORBIDDEN, format!("{uri_path} not readable: {e}"))
        })?;
        Ok((path, file, meta.len()))
    }
}

impl Docker for FileDocker {
    fn arrive(&self, harbor: &mut Harbor, tour: TourKey, check: TourId) -> Result<(), HttpError> {
        let deck = &mut harbor.deck;
        let Some(t) = deck.tours.checked_mut(tour, check) else {
            return Ok(());
        };
        let head_only = match t.req.method {
            Method::GET => false,
            Method::HEAD => true,
            _ => {
                return Err(HttpError::new(
                    StatusCode::METHOD_NOT_ALLOWED,
                    format!("{} not allowed on files", t.req.method),
                ))
            }
        };
        let (path, file, len) = self.open(t.req.uri.path())?;
        debug!(tour = %tour, path = %path.display(), len, "serving file");

        t.req_set_consumer(check, Consumer::Discard, &mut deck.posts);
        t.res.status = StatusCode::OK;
        t.res
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type(&path)));
        t.res.headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
        t.res_send_headers(check, &mut deck.posts);
        if head_only || len == 0 {
            t.res_end_content(check, &mut deck.posts);
            return Ok(());
        }
        SendFileShip::sail(harbor, file, self.timeouts, tour, check)
            .map(|_| ())
            .map_err(|e| HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, format!("file not streamed: {e}")))
    }
}
