//! Loads static sites from a `www` directory, one subdirectory per domain

use crate::error::RegistryError;
use crate::registry::{Domain, SiteRegistry};
use crate::virtual_server::{
    empty_body, full_body, handler, text_response, RequestHandler, ResponseWriter, SiteRequest,
    VirtualServer,
};
use anyhow::Context;
use hyper::{Method, Response, StatusCode};
use percent_encoding::percent_decode_str;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const INDEX_FILE: &str = "index.html";

/// Outcome of scanning the www directory
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<Domain>,
    pub skipped: Vec<RegistryError>,
}

/// Register every site directory under `www_dir`. A directory name is a domain,
/// optionally with `:port`.
pub fn load_sites(www_dir: &Path, registry: &mut SiteRegistry) -> anyhow::Result<LoadReport> {
    let mut dirs: Vec<(String, PathBuf)> = std::fs::read_dir(www_dir)
        .with_context(|| format!("Failed to read site directory '{}'", www_dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            Some((name, entry.path()))
        })
        .collect();
    dirs.sort();

    let mut report = LoadReport::default();

    for (name, path) in dirs {
        if !path.join(INDEX_FILE).is_file() {
            let err = RegistryError::InvalidHandler {
                domain: name,
                reason: format!("no {} in {}", INDEX_FILE, path.display()),
            };
            warn!(error = %err, "Skipping site");
            report.skipped.push(err);
            continue;
        }

        match registry.register(&name, static_site(path.clone())) {
            Ok(_) => {
                let (domain, port) = registry.parse_domain_with_port(&name)?;
                info!(domain = %domain, port, path = %path.display(), "Loaded site");
                report.loaded.push(domain);
            }
            Err(e) => {
                warn!(dir = %name, error = %e, "Skipping site");
                report.skipped.push(e);
            }
        }
    }

    Ok(report)
}

/// Factory serving files from `root`
pub fn static_site(root: PathBuf) -> impl Fn(&VirtualServer) -> Option<RequestHandler> + Send + Sync + 'static {
    move |_server: &VirtualServer| {
        let root = root.clone();
        Some(handler(move |req: SiteRequest, res: ResponseWriter| {
            let root = root.clone();
            async move {
                res.send(serve_file(&root, &req).await);
            }
        }))
    }
}

async fn serve_file(root: &Path, req: &SiteRequest) -> Response<crate::virtual_server::SiteBody> {
    if req.method() != Method::GET && req.method() != Method::HEAD {
        let mut response = text_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
        response.headers_mut().insert(
            hyper::header::ALLOW,
            hyper::header::HeaderValue::from_static("GET, HEAD"),
        );
        return response;
    }

    let Some(relative) = sanitize_path(req.uri().path()) else {
        return text_response(StatusCode::BAD_REQUEST, "Bad request");
    };

    let mut target = root.join(relative);
    if tokio::fs::metadata(&target).await.map(|m| m.is_dir()).unwrap_or(false) {
        target = target.join(INDEX_FILE);
    }

    let content = match tokio::fs::read(&target).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return text_response(StatusCode::NOT_FOUND, "Not found");
        }
        Err(e) => {
            debug!(path = %target.display(), error = %e, "Failed to read file");
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error");
        }
    };

    let builder = Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, content_type(&target))
        .header(hyper::header::CONTENT_LENGTH, content.len());

    let body = if req.method() == Method::HEAD {
        empty_body()
    } else {
        full_body(content)
    };
    builder.body(body).expect("valid response builder")
}

/// Percent-decoded relative path for a request path; None for traversal attempts
fn sanitize_path(path: &str) -> Option<PathBuf> {
    let mut relative = PathBuf::new();
    for segment in path.split('/') {
        let decoded = percent_decode_str(segment).decode_utf8().ok()?;
        match decoded.as_ref() {
            "" | "." => continue,
            ".." => return None,
            s if s.contains(['/', '\\', '\0']) => return None,
            s => relative.push(s),
        }
    }
    Some(relative)
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()).as_deref() {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") | Some("mjs") => "text/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("ico") => "image/x-icon",
        Some("webp") => "image/webp",
        Some("woff2") => "font/woff2",
        Some("wasm") => "application/wasm",
        _ => "application/octet-stream",
    }
}
