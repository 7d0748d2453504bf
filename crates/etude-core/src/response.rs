// src/response.rs
use crate::conn::Conn;
use crate::error::{EtudeError, EtudeResult};
use memmap2::Mmap;
use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use tracing::warn;

const CONTENT_TYPE: &str = "text/html";
const OTHER_READ: u32 = 0o004;

pub const OK_TITLE: &str = "OK";
pub const BAD_REQUEST_TITLE: &str = "Bad Request";
pub const BAD_REQUEST_BODY: &str =
    "Your request has bad syntax or is inherently impossible to satisfy.\n";
pub const FORBIDDEN_TITLE: &str = "Forbidden";
pub const FORBIDDEN_BODY: &str = "You do not have permission to get file from this server.\n";
pub const NOT_FOUND_TITLE: &str = "Not Found";
pub const NOT_FOUND_BODY: &str = "The requested file was not found on this server.\n";
pub const INTERNAL_ERROR_TITLE: &str = "Internal Error";
pub const INTERNAL_ERROR_BODY: &str = "There was an unusual problem serving the requested file.\n";

/// Directory the server publishes. URL paths are resolved beneath it.
#[derive(Debug, Clone)]
pub struct DocumentRoot {
    root: PathBuf,
}

impl DocumentRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Map a request path onto the filesystem. `None` if it tries to climb out of the root.
    pub fn resolve(&self, url: &str) -> Option<PathBuf> {
        let path = url.split(['?', '#']).next().unwrap_or("");
        let relative = Path::new(path.trim_start_matches('/'));
        if relative.components().any(|c| !matches!(c, Component::Normal(_) | Component::CurDir)) {
            return None;
        }
        Some(self.root.join(relative))
    }
}

/// Read-only private mapping of a whole file. Empty files carry no mapping.
pub struct MappedFile {
    map: Option<Mmap>,
}

impl MappedFile {
    /// Map `path`. The descriptor is closed as soon as the mapping exists.
    pub fn open(path: &Path) -> EtudeResult<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        if len == 0 {
            return Ok(Self { map: None });
        }
        // SAFETY: the mapping is read-only and private; files under the document root
        // are not expected to be truncated while being served.
        let map = unsafe { Mmap::map(&file)? };
        drop(file);
        Ok(Self { map: Some(map) })
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of resolving a validated request against the document root.
pub enum Resolution {
    FileFound(MappedFile),
    BadRequest,
    Forbidden,
    NotFound,
    InternalError,
}

impl Resolution {
    /// Stat, permission-check and map the file a request names.
    pub fn locate(root: &DocumentRoot, url: &str) -> Resolution {
        let Some(path) = root.resolve(url) else {
            return Resolution::Forbidden;
        };

        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(_) => return Resolution::NotFound,
        };
        if meta.permissions().mode() & OTHER_READ == 0 {
            return Resolution::Forbidden;
        }
        if meta.is_dir() {
            return Resolution::BadRequest;
        }

        match MappedFile::open(&path) {
            Ok(file) => Resolution::FileFound(file),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to map file");
                Resolution::InternalError
            }
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Resolution::FileFound(_) => 200,
            Resolution::BadRequest => 400,
            Resolution::Forbidden => 403,
            Resolution::NotFound => 404,
            Resolution::InternalError => 500,
        }
    }
}

impl Conn {
    /// Render the status line, headers and (for errors) the canned page into `write_buf`,
    /// then lay out the send plan.
    pub(crate) fn build_response(&mut self, resolution: Resolution) -> EtudeResult<()> {
        self.write_len = 0;
        self.file = None;

        let (code, title, body) = match resolution {
            Resolution::FileFound(file) => {
                let file_len = file.len();
                self.add_headers(200, OK_TITLE, file_len)?;
                self.file = Some(file);
                self.plan.start(self.write_len, file_len);
                return Ok(());
            }
            Resolution::BadRequest => (400, BAD_REQUEST_TITLE, BAD_REQUEST_BODY),
            Resolution::Forbidden => (403, FORBIDDEN_TITLE, FORBIDDEN_BODY),
            Resolution::NotFound => (404, NOT_FOUND_TITLE, NOT_FOUND_BODY),
            Resolution::InternalError => (500, INTERNAL_ERROR_TITLE, INTERNAL_ERROR_BODY),
        };

        self.add_headers(code, title, body.len())?;
        self.add_bytes(body.as_bytes())?;
        self.plan.start(self.write_len, 0);
        Ok(())
    }

    fn add_headers(&mut self, code: u16, title: &str, content_length: usize) -> EtudeResult<()> {
        let connection = if self.keep_alive { "keep-alive" } else { "close" };
        let mut cursor = &mut self.write_buf[self.write_len..];
        let room = cursor.len();
        write!(
            cursor,
            "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nContent-Type: {}\r\nConnection: {}\r\n\r\n",
            code, title, content_length, CONTENT_TYPE, connection
        )
        .map_err(|_| EtudeError::WriteBufferFull)?;
        self.write_len += room - cursor.len();
        Ok(())
    }

    fn add_bytes(&mut self, bytes: &[u8]) -> EtudeResult<()> {
        let end = self.write_len + bytes.len();
        let dst = self
            .write_buf
            .get_mut(self.write_len..end)
            .ok_or(EtudeError::WriteBufferFull)?;
        dst.copy_from_slice(bytes);
        self.write_len = end;
        Ok(())
    }
}
