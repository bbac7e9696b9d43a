// Copyright 2025 EdgeFS project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use fs::{ErrorKind, FsError, Metadata};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{ErrorCode, ServiceError};
use crate::sessions::Session;
use crate::ServiceState;

pub(crate) async fn dispatch(
    state: &ServiceState,
    method: &str,
    params: Value,
) -> Result<Value, ServiceError> {
    match method {
        "ping" => ping().await,
        "batchRead" => batch_read(state, parse(params)?).await,
        "batchWrite" => batch_write(state, parse(params)?).await,
        "batchDelete" => batch_delete(state, parse(params)?).await,
        "batchStat" => batch_stat(state, parse(params)?).await,
        "streamReadStart" => stream_read_start(state, parse(params)?).await,
        "streamReadChunk" => stream_read_chunk(state, parse(params)?).await,
        "streamReadEnd" => stream_end(state, parse(params)?).await,
        "streamWriteStart" => stream_write_start(state, parse(params)?).await,
        "streamWriteChunk" => stream_write_chunk(state, parse(params)?).await,
        "streamWriteEnd" => stream_write_end(state, parse(params)?).await,
        "streamAbort" => stream_abort(state, parse(params)?).await,
        "copyTree" => copy_tree(state, parse(params)?).await,
        "moveTree" => move_tree(state, parse(params)?).await,
        "dirSize" => dir_size(state, parse(params)?).await,
        "checksum" => checksum(state, parse(params)?).await,
        "verify" => verify(state, parse(params)?).await,
        other => Err(ServiceError::method_not_found(other)),
    }
}

fn parse<T: for<'de> Deserialize<'de>>(params: Value) -> Result<T, ServiceError> {
    serde_json::from_value(params)
        .map_err(|e| ServiceError::invalid_data(format!("malformed params: {e}")))
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

async fn ping() -> Result<Value, ServiceError> {
    Ok(json!({ "pong": true, "timeMs": now_ms() }))
}

// ----- batches ------------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchReadParams {
    paths: Vec<String>,
    #[serde(default)]
    continue_on_error: bool,
}

struct BatchTally {
    results: Vec<Value>,
    succeeded: usize,
    failed: usize,
}

impl BatchTally {
    fn new() -> BatchTally {
        BatchTally {
            results: Vec::new(),
            succeeded: 0,
            failed: 0,
        }
    }

    fn success(&mut self, item: Value) {
        self.succeeded += 1;
        self.results.push(item);
    }

    fn failure(
        &mut self,
        path: &str,
        error: FsError,
        continue_on_error: bool,
    ) -> Result<(), ServiceError> {
        if !continue_on_error {
            return Err(error.into());
        }
        self.failed += 1;
        self.results.push(json!({
            "path": path,
            "ok": false,
            "error": { "code": error.kind.code(), "message": error.message },
        }));
        Ok(())
    }

    fn finish(self, total: usize) -> Value {
        json!({
            "total": total,
            "succeeded": self.succeeded,
            "failed": self.failed,
            "results": self.results,
        })
    }
}

async fn batch_read(
    state: &ServiceState,
    params: BatchReadParams,
) -> Result<Value, ServiceError> {
    let total = params.paths.len();
    let mut tally = BatchTally::new();
    for path in &params.paths {
        match state.fs.read(path).await {
            Ok(content) => tally.success(json!({
                "path": path,
                "ok": true,
                "data": BASE64.encode(&content),
                "size": content.len(),
            })),
            Err(e) => tally.failure(path, e, params.continue_on_error)?,
        }
    }
    Ok(tally.finish(total))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteItem {
    path: String,
    data: String,
    mode: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchWriteParams {
    files: Vec<WriteItem>,
    #[serde(default)]
    continue_on_error: bool,
}

async fn batch_write(
    state: &ServiceState,
    params: BatchWriteParams,
) -> Result<Value, ServiceError> {
    let total = params.files.len();
    let mut tally = BatchTally::new();
    for item in &params.files {
        let bytes = match BASE64.decode(&item.data) {
            Ok(bytes) => bytes,
            Err(e) => {
                return Err(ServiceError::invalid_data(format!(
                    "payload for {} is not valid base64: {e}",
                    item.path
                )))
            }
        };
        match state.fs.write(&item.path, &bytes, item.mode).await {
            Ok(outcome) => tally.success(json!({
                "path": item.path,
                "ok": true,
                "bytesWritten": outcome.bytes_written,
                "tier": outcome.tier.as_str(),
            })),
            Err(e) => tally.failure(&item.path, e, params.continue_on_error)?,
        }
    }
    Ok(tally.finish(total))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchDeleteParams {
    paths: Vec<String>,
    #[serde(default)]
    recursive: bool,
    #[serde(default)]
    continue_on_error: bool,
}

async fn batch_delete(
    state: &ServiceState,
    params: BatchDeleteParams,
) -> Result<Value, ServiceError> {
    let total = params.paths.len();
    let mut tally = BatchTally::new();
    for path in &params.paths {
        let outcome = match state.fs.unlink(path).await {
            Err(e) if e.kind == ErrorKind::IsADirectory => {
                state.fs.rmdir(path, params.recursive).await
            }
            other => other,
        };
        match outcome {
            Ok(()) => tally.success(json!({ "path": path, "ok": true })),
            Err(e) => tally.failure(path, e, params.continue_on_error)?,
        }
    }
    Ok(tally.finish(total))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchStatParams {
    paths: Vec<String>,
    #[serde(default)]
    continue_on_error: bool,
}

fn stat_json(path: &str, meta: &Metadata) -> Value {
    json!({
        "path": path,
        "ok": true,
        "kind": meta.kind.as_str(),
        "size": meta.size,
        "mode": meta.mode,
        "uid": meta.uid,
        "gid": meta.gid,
        "nlink": meta.nlink,
        "ino": meta.ino,
        "atimeMs": meta.atime_ms(),
        "mtimeMs": meta.mtime_ms(),
        "ctimeMs": meta.ctime_ms(),
        "birthtimeMs": meta.birthtime_ms(),
    })
}

async fn batch_stat(
    state: &ServiceState,
    params: BatchStatParams,
) -> Result<Value, ServiceError> {
    let total = params.paths.len();
    let mut tally = BatchTally::new();
    for path in &params.paths {
        match state.fs.stat(path).await {
            Ok(meta) => tally.success(stat_json(path, &meta)),
            Err(e) => tally.failure(path, e, params.continue_on_error)?,
        }
    }
    Ok(tally.finish(total))
}

// ----- streaming ----------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamReadStartParams {
    path: String,
    chunk_size: Option<usize>,
}

async fn stream_read_start(
    state: &ServiceState,
    params: StreamReadStartParams,
) -> Result<Value, ServiceError> {
    let chunk_size = validated_chunk_size(params.chunk_size, state.chunk_size)?;
    let content = state.fs.read(&params.path).await?;
    let total_size = content.len();
    let (session_id, total_chunks) =
        state
            .sessions
            .open_read(params.path.clone(), content, chunk_size);
    Ok(json!({
        "sessionId": session_id,
        "totalSize": total_size,
        "totalChunks": total_chunks,
        "chunkSize": chunk_size,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamChunkParams {
    session_id: String,
    index: u64,
}

async fn stream_read_chunk(
    state: &ServiceState,
    params: StreamChunkParams,
) -> Result<Value, ServiceError> {
    state.sessions.with_session(&params.session_id, |session| {
        let Session::Read(read) = session else {
            return Err(ServiceError::invalid_data(
                "session is a write session, not a read session",
            ));
        };
        let total = read.total_chunks();
        if params.index >= total {
            return Err(ServiceError::invalid_data(format!(
                "chunk index {} out of range (total {total})",
                params.index
            )));
        }
        let offset = (params.index as usize) * read.chunk_size;
        let end = (offset + read.chunk_size).min(read.content.len());
        let data = &read.content[offset.min(read.content.len())..end];
        Ok(json!({
            "index": params.index,
            "offset": offset,
            "data": BASE64.encode(data),
            "isLast": params.index + 1 == total,
        }))
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamEndParams {
    session_id: String,
}

async fn stream_end(
    state: &ServiceState,
    params: StreamEndParams,
) -> Result<Value, ServiceError> {
    state.sessions.take(&params.session_id)?;
    Ok(json!({ "closed": true }))
}

async fn stream_abort(
    state: &ServiceState,
    params: StreamEndParams,
) -> Result<Value, ServiceError> {
    state.sessions.abort(&params.session_id)?;
    Ok(json!({ "aborted": true }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamWriteStartParams {
    path: String,
    total_size: u64,
    chunk_size: Option<usize>,
}

async fn stream_write_start(
    state: &ServiceState,
    params: StreamWriteStartParams,
) -> Result<Value, ServiceError> {
    let chunk_size = validated_chunk_size(params.chunk_size, state.chunk_size)?;
    let (session_id, total_chunks) =
        state
            .sessions
            .open_write(params.path, params.total_size, chunk_size);
    Ok(json!({
        "sessionId": session_id,
        "totalChunks": total_chunks,
        "chunkSize": chunk_size,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamWriteChunkParams {
    session_id: String,
    index: u64,
    data: String,
}

async fn stream_write_chunk(
    state: &ServiceState,
    params: StreamWriteChunkParams,
) -> Result<Value, ServiceError> {
    let bytes = BASE64
        .decode(&params.data)
        .map_err(|e| ServiceError::invalid_data(format!("chunk is not valid base64: {e}")))?;
    state.sessions.with_session(&params.session_id, |session| {
        let Session::Write(write) = session else {
            return Err(ServiceError::invalid_data(
                "session is a read session, not a write session",
            ));
        };
        let expected = write.expected_chunks();
        if params.index >= expected {
            return Err(ServiceError::invalid_data(format!(
                "chunk index {} out of range (expected {expected})",
                params.index
            )));
        }
        write.chunks.insert(params.index, Bytes::from(bytes));
        Ok(json!({ "received": write.chunks.len() }))
    })
}

async fn stream_write_end(
    state: &ServiceState,
    params: StreamEndParams,
) -> Result<Value, ServiceError> {
    let session = state.sessions.take(&params.session_id)?;
    let Session::Write(write) = session else {
        return Err(ServiceError::invalid_data(
            "session is a read session, not a write session",
        ));
    };

    let expected = write.expected_chunks();
    let mut content = Vec::with_capacity(write.total_size as usize);
    for index in 0..expected {
        let chunk = write.chunks.get(&index).ok_or_else(|| {
            ServiceError::invalid_data(format!("missing chunk {index} of {expected}"))
        })?;
        content.extend_from_slice(chunk);
    }
    if content.len() as u64 != write.total_size {
        return Err(ServiceError::new(
            ErrorCode::SizeMismatch,
            format!(
                "declared {} bytes but received {}",
                write.total_size,
                content.len()
            ),
        ));
    }

    let outcome = state.fs.write(&write.path, &content, None).await?;
    let digest = hashing::Digest::of_bytes(&content);
    Ok(json!({
        "path": write.path,
        "bytesWritten": outcome.bytes_written,
        "checksum": digest.hash.to_hex(),
    }))
}

fn validated_chunk_size(
    requested: Option<usize>,
    default: usize,
) -> Result<usize, ServiceError> {
    match requested {
        None => Ok(default),
        Some(0) => Err(ServiceError::invalid_data("chunkSize must be positive")),
        Some(size) => Ok(size),
    }
}

// ----- whole-tree helpers -------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TreeParams {
    src: String,
    dst: String,
}

async fn copy_tree(state: &ServiceState, params: TreeParams) -> Result<Value, ServiceError> {
    let copied = copy_tree_inner(state, &params.src, &params.dst).await?;
    Ok(json!({ "src": params.src, "dst": params.dst, "copied": copied }))
}

async fn copy_tree_inner(
    state: &ServiceState,
    src: &str,
    dst: &str,
) -> Result<u64, ServiceError> {
    let meta = state.fs.lstat(src).await?;
    if meta.is_symlink() {
        let target = state.fs.readlink(src).await?;
        state.fs.symlink(&target, dst).await?;
        return Ok(1);
    }
    if meta.is_file() {
        state.fs.copy_file(src, dst).await?;
        return Ok(1);
    }
    state.fs.mkdir(dst, true, Some(meta.mode)).await?;
    let mut copied = 1;
    for entry in state.fs.readdir_typed(src).await? {
        let child_src = join(src, &entry.name);
        let child_dst = join(dst, &entry.name);
        copied += Box::pin(copy_tree_inner(state, &child_src, &child_dst)).await?;
    }
    Ok(copied)
}

async fn move_tree(state: &ServiceState, params: TreeParams) -> Result<Value, ServiceError> {
    state.fs.rename(&params.src, &params.dst).await?;
    Ok(json!({ "src": params.src, "dst": params.dst, "moved": true }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PathParams {
    path: String,
}

async fn dir_size(state: &ServiceState, params: PathParams) -> Result<Value, ServiceError> {
    let mut bytes = 0_u64;
    let mut files = 0_u64;
    let mut directories = 0_u64;
    let mut stack = vec![params.path.clone()];
    while let Some(dir) = stack.pop() {
        for entry in state.fs.readdir_typed(&dir).await? {
            let child = join(&dir, &entry.name);
            let meta = state.fs.lstat(&child).await?;
            if meta.is_dir() {
                directories += 1;
                stack.push(child);
            } else {
                files += 1;
                bytes += meta.size;
            }
        }
    }
    Ok(json!({
        "path": params.path,
        "bytes": bytes,
        "files": files,
        "directories": directories,
    }))
}

async fn checksum(state: &ServiceState, params: PathParams) -> Result<Value, ServiceError> {
    let digest = state.fs.file_digest(&params.path).await?;
    Ok(json!({
        "path": params.path,
        "checksum": digest.hash.to_hex(),
        "size": digest.size_bytes,
    }))
}

async fn verify(state: &ServiceState, params: PathParams) -> Result<Value, ServiceError> {
    let digest = state.fs.file_digest(&params.path).await?;
    let valid = state
        .fs
        .store()
        .verify(digest.hash)
        .await
        .map_err(ServiceError::invalid_data)?;
    Ok(json!({ "path": params.path, "valid": valid }))
}

fn join(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}
