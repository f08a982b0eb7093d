use crate::AppState;
use crate::errors::ApiError;
use crate::metrics_defs::{UPLOAD_DURATION, UPLOAD_FILES};
use axum::Json;
use axum::extract::{Multipart, State};
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use bytes::Bytes;
use pages::{CommitMeta, Page};
use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use std::time::Instant;
use tokio::task::JoinSet;

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub status: &'static str,
    pub file_count: usize,
    pub url: String,
    pub preview_url: Vec<String>,
}

/// `POST /upload`: the end-to-end ingest pipeline.
///
/// Stages run strictly in order: verify the bearer token, select the tenant
/// by repository claim, spool the multipart files to disk, publish them to
/// object storage, merge the page index, drop the cached index, and answer
/// with the preview URLs.
pub async fn upload_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let start = Instant::now();

    let token = bearer_token(&headers).ok_or(ApiError::Auth(crate::oidc::AuthError::MissingBearer))?;

    let meta = state
        .verifier
        .verify(&token, &state.issuers)
        .await
        .map_err(ApiError::Auth)?;

    let page = state
        .registry
        .find_by_repository(&meta.repository)
        .ok_or(ApiError::RepositoryNotAuthorized)?;

    let spool = spool_artifacts(multipart, &meta.commit_id).await?;

    let store = state.stores.store_for(&page)?;
    let remote_prefix = format!("{}/{}", meta.repository, meta.commit_id);
    store
        .upload_tree(&spool.root, &remote_prefix)
        .await
        .map_err(ApiError::Publish)?;

    let mut index = store.read_index().await.map_err(ApiError::Index)?;
    index.merge(meta.clone());
    store.write_index(&index).await.map_err(ApiError::Index)?;

    // Drop the cached index so serves on this process pick up the new commit
    // without waiting out the TTL
    state.cache.invalidate(&page.domain);

    // The spool directory has served its purpose; leftover files are only a
    // disk-space concern, so failures here don't fail the request
    let _ = tokio::fs::remove_dir_all(&spool.root).await;

    let preview_url = preview_urls(&page, &meta);

    metrics::counter!(UPLOAD_FILES.name, "repository" => meta.repository.clone())
        .increment(spool.file_count as u64);
    metrics::histogram!(UPLOAD_DURATION.name).record(start.elapsed().as_secs_f64());

    tracing::info!(
        repository = %meta.repository,
        commit = %meta.commit_id,
        file_count = spool.file_count,
        size = spool.total_bytes,
        "upload successful"
    );

    Ok(Json(UploadResponse {
        status: "upload successful",
        file_count: spool.file_count,
        url: page.domain.to_string(),
        preview_url,
    }))
}

/// `PUT /activate` is reserved.
pub async fn activate_handler() -> (axum::http::StatusCode, Json<serde_json::Value>) {
    (
        axum::http::StatusCode::NOT_IMPLEMENTED,
        Json(serde_json::json!({ "error": "not implemented" })),
    )
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

struct SpoolResult {
    root: PathBuf,
    file_count: usize,
    total_bytes: u64,
}

/// Writes each `files[<relative path>]` part to `<tmp>/<commit>/<path>`.
///
/// Fields with other names are skipped silently. The multipart stream is
/// read sequentially, but file writes run concurrently; the first write
/// error fails the spool while in-flight writes finish on their own.
async fn spool_artifacts(mut multipart: Multipart, commit_id: &str) -> Result<SpoolResult, ApiError> {
    let root = std::env::temp_dir().join(commit_id);

    let mut writes = JoinSet::new();
    let mut file_count = 0usize;
    let mut total_bytes = 0u64;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(error) => {
                abandon(writes).await;
                return Err(multipart_error(error));
            }
        };

        let Some(relative) = field.name().and_then(extract_relative_path) else {
            continue;
        };

        let Some(destination) = safe_join(&root, &relative) else {
            abandon(writes).await;
            return Err(ApiError::InvalidFilePath(relative));
        };

        let data = match field.bytes().await {
            Ok(data) => data,
            Err(error) => {
                abandon(writes).await;
                return Err(multipart_error(error));
            }
        };

        file_count += 1;
        total_bytes += data.len() as u64;
        writes.spawn(write_spool_file(destination, data));
    }

    let mut first_error = None;
    while let Some(joined) = writes.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(error)) if first_error.is_none() => first_error = Some(error),
            Ok(Err(_)) => {}
            Err(join_error) => {
                tracing::error!(error = %join_error, "spool write task panicked");
            }
        }
    }

    if let Some(error) = first_error {
        return Err(ApiError::Spool(error));
    }

    Ok(SpoolResult {
        root,
        file_count,
        total_bytes,
    })
}

async fn write_spool_file(destination: PathBuf, data: Bytes) -> Result<(), std::io::Error> {
    tokio::task::spawn_blocking(move || {
        if let Some(parent) = destination.parent() {
            let mut builder = std::fs::DirBuilder::new();
            builder.recursive(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::DirBuilderExt;
                builder.mode(0o775);
            }
            builder.create(parent)?;
        }
        std::fs::write(&destination, &data)
    })
    .await
    .unwrap_or_else(|_| Err(std::io::Error::other("spool write task aborted")))
}

/// Lets in-flight writes finish after the spool has already failed; their
/// results no longer matter.
async fn abandon(mut writes: JoinSet<Result<(), std::io::Error>>) {
    while writes.join_next().await.is_some() {}
}

/// A client that disconnects mid-upload surfaces here as an I/O failure
/// while reading the body; that is answered with 499, not 400. Everything
/// else is a genuinely malformed form.
fn multipart_error(error: axum::extract::multipart::MultipartError) -> ApiError {
    let mut source = std::error::Error::source(&error);
    while let Some(current) = source {
        if current.downcast_ref::<std::io::Error>().is_some() {
            return ApiError::Canceled;
        }
        source = current.source();
    }
    ApiError::InvalidForm(error)
}

/// Pulls `<relative path>` out of a `files[<relative path>]` field name.
fn extract_relative_path(field_name: &str) -> Option<String> {
    field_name
        .strip_prefix("files[")?
        .strip_suffix(']')
        .map(str::to_string)
}

/// Joins `relative` below `root`, refusing absolute paths and any `..`
/// component.
fn safe_join(root: &Path, relative: &str) -> Option<PathBuf> {
    let relative = Path::new(relative);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return None;
    }
    Some(root.join(relative))
}

/// One URL per enabled preview axis. Claim values are forced into legal DNS
/// labels; an axis whose value cannot become one is dropped.
fn preview_urls(page: &Page, meta: &CommitMeta) -> Vec<String> {
    if !page.preview.enabled {
        return Vec::new();
    }

    let mut urls = Vec::new();
    let axes = [
        (page.preview.branch, meta.branch.as_str(), "branch"),
        (page.preview.commit, meta.commit_id.as_str(), "commit"),
        (page.preview.environment, meta.environment.as_str(), "environment"),
    ];

    for (enabled, value, axis) in axes {
        if !enabled {
            continue;
        }
        match dns_label(value) {
            Some(label) => urls.push(format!("https://{label}.{}", page.domain)),
            None => tracing::warn!(axis, value, "preview value is not a usable DNS label"),
        }
    }

    urls
}

/// Squeezes a value into a legal DNS label: lowercase, `[a-z0-9-]`, at most
/// 63 characters, no leading or trailing hyphen. `None` when nothing
/// usable remains.
fn dns_label(value: &str) -> Option<String> {
    let mut label: String = value
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    label.truncate(63);
    let label = label.trim_matches('-').to_string();

    if label.is_empty() { None } else { Some(label) }
}
