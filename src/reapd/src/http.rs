//! The control-plane HTTP server (§10.3): a single-threaded `micro_http::HttpServer` accept
//! loop binding a unix-domain socket, routing each request onto one `Orchestrator` call.

use std::path::PathBuf;
use std::sync::Arc;

use micro_http::{Body, HttpServer, Method, Request, Response, StatusCode, Version};
use reap_engine::orchestrator::{Orchestrator, RegisterRequest};
use reap_engine::ErrorKind;

use crate::dto::{
    CacheBody, CloneBody, ErrorBody, IdResponse, MincoreOp, OffsetsResponse, PrewarmBody,
    RegionsBody, RegisterBody, SummaryResponse, WsBody,
};
use crate::metrics::{self, ActivationRow};

/// Binds `socket_path` and serves requests against `orchestrator` until the process exits.
/// Mirrors the teacher's `api_server` accept loop: one thread, `server.requests()` blocks
/// for the next batch, each request is answered in turn.
pub fn run(
    socket_path: &std::path::Path,
    orchestrator: Arc<Orchestrator>,
    metrics_csv_path: PathBuf,
) -> std::io::Result<()> {
    std::fs::remove_file(socket_path).ok();
    let mut server = HttpServer::new(socket_path)
        .map_err(|e| std::io::Error::other(format!("failed to bind {}: {e}", socket_path.display())))?;
    server
        .start_server()
        .map_err(|e| std::io::Error::other(format!("failed to start http server: {e}")))?;

    log::info!("reapd control plane listening on {}", socket_path.display());

    loop {
        match server.requests() {
            Ok(requests) => {
                for server_request in requests {
                    let response = server_request
                        .process(|request| dispatch(request, &orchestrator, &metrics_csv_path));
                    if let Err(e) = server.respond(response) {
                        log::error!("failed to send http response: {e}");
                    }
                }
            }
            Err(e) => {
                log::error!("http server error: {e}");
            }
        }
    }
}

fn dispatch(request: &Request, orchestrator: &Orchestrator, metrics_csv_path: &std::path::Path) -> Response {
    let path = request.uri().get_abs_path().to_string();
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    let result = route(
        request.method(),
        &segments,
        request.body.as_ref(),
        orchestrator,
        metrics_csv_path,
    );
    match result {
        Ok(response) => response,
        Err(err) => error_response(err),
    }
}

/// Matches `(method, path segments)` against the route table and runs the handler.
fn route(
    method: Method,
    segments: &[&str],
    body: Option<&Body>,
    orchestrator: &Orchestrator,
    metrics_csv_path: &std::path::Path,
) -> Result<Response, reap_engine::EngineError> {
    use reap_engine::EngineError::InvalidArgument;

    match (method, segments) {
        (Method::Put, ["snapshots", id]) => {
            let req: RegisterBody = parse_body(body)?;
            let id = orchestrator.register(RegisterRequest {
                id: Some((*id).to_string()),
                vmm_state_path: req.vmm_state_path,
                guest_mem_path: req.guest_mem_path,
                base_dir: req.base_dir,
                mem_size: req.mem_size,
                block_size: req.block_size,
                ws_file_direct_io: req.ws_file_direct_io,
                ws_single_read: req.ws_single_read,
            })?;
            Ok(json_response(StatusCode::Created, &IdResponse { id }))
        }
        (Method::Delete, ["snapshots", id]) => {
            orchestrator.deregister(id)?;
            Ok(empty_response(StatusCode::NoContent))
        }
        (Method::Post, ["snapshots", id, "clone"]) => {
            let req: CloneBody = parse_body(body)?;
            let new_id = orchestrator.clone_snapshot(id, req.new_mem_path)?;
            Ok(json_response(StatusCode::Created, &IdResponse { id: new_id }))
        }
        (Method::Put, ["instances", id]) => {
            orchestrator.activate(id)?;
            Ok(empty_response(StatusCode::NoContent))
        }
        (Method::Delete, ["instances", id]) => {
            let trace_replay = orchestrator.registry.get(id)?.ws_path().is_some();
            let (offsets, metrics, elapsed) = orchestrator.deactivate(id)?;
            let mean_latency_us = if metrics.served > 0 {
                elapsed.as_micros() as f64 / metrics.served as f64
            } else {
                0.0
            };
            let row = ActivationRow {
                snapshot_id: (*id).to_string(),
                instance_id: (*id).to_string(),
                metrics,
                mean_latency_us,
                trace_replay,
            };
            if let Err(e) = metrics::append_row(metrics_csv_path, &row) {
                log::warn!("failed to append activation metrics for {id}: {e}");
            }
            Ok(json_response(StatusCode::OK, &OffsetsResponse { recorded_offsets: offsets }))
        }
        (Method::Patch, ["snapshots", id, "mincore"]) => {
            let op: MincoreOp = parse_body(body)?;
            match op {
                MincoreOp::ScanMincoreStart {
                    pid_for_rss,
                    interval_ms,
                    size_incr_bytes,
                } => orchestrator.start_scan_mincore(id, pid_for_rss, interval_ms, size_incr_bytes)?,
                MincoreOp::ScanMincoreStop => orchestrator.stop_scan_mincore(id)?,
                MincoreOp::EmulateMincore { layer_size } => {
                    orchestrator.emulate_mincore(id, layer_size)?
                }
                MincoreOp::InsertMincoreLayer {
                    from_diff_id,
                    position,
                } => orchestrator.insert_mincore_layer(id, &from_diff_id, position)?,
                MincoreOp::CopyMincore { src_id } => orchestrator.copy_mincore(id, &src_id)?,
            }
            Ok(empty_response(StatusCode::NoContent))
        }
        (Method::Get, ["snapshots", id, "mincore"]) => {
            let summary = orchestrator.mincore_summary(id)?;
            Ok(json_response(StatusCode::OK, &SummaryResponse::from(summary)))
        }
        (Method::Patch, ["snapshots", id, "cache"]) => {
            let req: CacheBody = parse_body(body)?;
            orchestrator.update_cache_state(id, req.dig_hole, req.load_cache, req.drop_cache)?;
            Ok(empty_response(StatusCode::NoContent))
        }
        (Method::Delete, ["snapshots", id, "cache"]) => {
            orchestrator.clear_reap_cache(id)?;
            Ok(empty_response(StatusCode::NoContent))
        }
        (Method::Post, ["snapshots", id, "regions"]) => {
            let req: RegionsBody = parse_body(body)?;
            orchestrator.record_regions(id, req.size_threshold, req.interval_threshold)?;
            Ok(empty_response(StatusCode::NoContent))
        }
        (Method::Post, ["snapshots", id, "ws"]) => {
            let req: WsBody = parse_body(body)?;
            orchestrator.create_ws_file(
                id,
                req.path,
                req.with_inactive,
                req.with_zero,
                req.size_threshold,
                req.interval_threshold,
            )?;
            Ok(empty_response(StatusCode::NoContent))
        }
        (Method::Post, ["snapshots", id, "prewarm"]) => {
            let req: PrewarmBody = parse_body(body)?;
            orchestrator.pre_warm_mincore(id, &req.layers)?;
            Ok(empty_response(StatusCode::NoContent))
        }
        (Method::Post, ["snapshots", id, "trim"]) => {
            orchestrator.trim_mincore_regions(id)?;
            Ok(empty_response(StatusCode::NoContent))
        }
        (Method::Post, ["snapshots", id, "ws", "drop"]) => {
            orchestrator.drop_ws_cache(id)?;
            Ok(empty_response(StatusCode::NoContent))
        }
        _ => Err(InvalidArgument(format!(
            "no route for {} /{}",
            method_name(method),
            segments.join("/")
        ))),
    }
}

fn parse_body<T: serde::de::DeserializeOwned>(
    body: Option<&Body>,
) -> Result<T, reap_engine::EngineError> {
    let raw = body
        .ok_or_else(|| reap_engine::EngineError::InvalidArgument("missing request body".into()))?;
    serde_json::from_slice(raw.raw())
        .map_err(|e| reap_engine::EngineError::InvalidArgument(format!("malformed json body: {e}")))
}

fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> Response {
    let mut response = Response::new(Version::Http11, status);
    let payload = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    response.set_body(Body::new(payload));
    response
}

fn empty_response(status: StatusCode) -> Response {
    Response::new(Version::Http11, status)
}

fn error_response(err: reap_engine::EngineError) -> Response {
    let status = match err.kind() {
        ErrorKind::NotFound => StatusCode::NotFound,
        ErrorKind::InvalidArgument => StatusCode::BadRequest,
        ErrorKind::InvalidState => StatusCode::Conflict,
        ErrorKind::ResourceConflict => StatusCode::Conflict,
        ErrorKind::IoFailure | ErrorKind::KernelFailure => StatusCode::InternalServerError,
    };
    log::warn!("request failed: {err}");
    json_response(status, &ErrorBody { error: err.to_string() })
}

fn method_name(method: Method) -> &'static str {
    match method {
        Method::Get => "GET",
        Method::Put => "PUT",
        Method::Post => "POST",
        Method::Patch => "PATCH",
        Method::Delete => "DELETE",
        _ => "?",
    }
}
