//! Boot image serving from the images cache
//!
//! ```text
//! <images_cache_dir>/<flatcar version>/
//!   coreos_production_pxe.vmlinuz
//!   coreos_production_pxe_image.cpio.gz
//!   coreos_production_image.bin.bz2
//! ```

use axum::body::Body;
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use std::path::{Path, PathBuf};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::AppState;

/// An image machines fetch while booting or installing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Image {
    Kernel,
    Initrd,
    InstallImage,
}

impl Image {
    /// The name used in boot URLs
    pub fn from_request_name(name: &str) -> Option<Self> {
        match name {
            "vmlinuz" => Some(Image::Kernel),
            "initrd.cpio.gz" => Some(Image::Initrd),
            "install_image.bin.bz2" => Some(Image::InstallImage),
            _ => None,
        }
    }

    /// The file name inside a version directory of the cache
    pub fn file_name(&self) -> &'static str {
        match self {
            Image::Kernel => "coreos_production_pxe.vmlinuz",
            Image::Initrd => "coreos_production_pxe_image.cpio.gz",
            Image::InstallImage => "coreos_production_image.bin.bz2",
        }
    }

    pub fn path(&self, cache_dir: &Path, version: &str) -> PathBuf {
        cache_dir.join(version).join(self.file_name())
    }
}

/// A version must name a single directory inside the cache. Hosts report
/// their version themselves through `boot_complete`.
pub fn is_valid_version(version: &str) -> bool {
    !version.is_empty()
        && version != "."
        && !version.contains("..")
        && !version.contains(['/', '\\'])
}

/// Stream a file with an exact Content-Length
pub async fn serve_file(path: &Path, content_type: &'static str) -> Response {
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot open file");
            let status = if e.kind() == std::io::ErrorKind::NotFound {
                StatusCode::NOT_FOUND
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            return (status, format!("cannot open {}", path.display())).into_response();
        }
    };
    let length = match file.metadata().await {
        Ok(meta) => meta.len(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot stat file");
            return (StatusCode::INTERNAL_SERVER_ERROR, "cannot stat file").into_response();
        }
    };

    debug!(path = %path.display(), length, "serving file");
    let body = Body::from_stream(ReaderStream::new(file));
    (
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CONTENT_LENGTH, length.to_string()),
        ],
        body,
    )
        .into_response()
}

async fn serve_image(state: &AppState, serial: Option<&str>, name: &str) -> Response {
    let Some(image) = Image::from_request_name(name) else {
        return (StatusCode::NOT_FOUND, format!("no image named {}", name)).into_response();
    };

    let host = match serial {
        Some(serial) => {
            let serial = serial.to_string();
            match state
                .provisioning
                .blocking(move |svc| Ok(svc.cluster().host_by_serial(&serial)))
                .await
            {
                Ok(host) => host,
                Err(e) => return e.into_response(),
            }
        }
        None => None,
    };

    // a known host gets the version it was provisioned with
    let version = host
        .map(|h| h.flatcar_version)
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| state.provisioning.config().default_flatcar_version.clone());
    if !is_valid_version(&version) {
        warn!(version = %version, serial = serial.unwrap_or(""), "refusing image version outside the cache");
        return (StatusCode::BAD_REQUEST, "invalid image version").into_response();
    }

    info!(image = name, version = %version, serial = serial.unwrap_or(""), "sending image");
    let path = image.path(&state.options.images_cache_dir, &version);
    serve_file(&path, "application/octet-stream").await
}

pub async fn image(State(state): State<AppState>, UrlPath(name): UrlPath<String>) -> Response {
    serve_image(&state, None, &name).await
}

pub async fn host_image(
    State(state): State<AppState>,
    UrlPath((serial, name)): UrlPath<(String, String)>,
) -> Response {
    serve_image(&state, Some(&serial), &name).await
}
