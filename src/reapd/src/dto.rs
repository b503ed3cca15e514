//! JSON request/response bodies for the HTTP control plane (§10.3). Transport-level
//! shapes only — everything here converts directly into an `Orchestrator` call.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct RegisterBody {
    pub vmm_state_path: PathBuf,
    pub guest_mem_path: PathBuf,
    pub base_dir: PathBuf,
    #[serde(default)]
    pub mem_size: u64,
    #[serde(default)]
    pub block_size: u64,
    #[serde(default)]
    pub ws_file_direct_io: bool,
    #[serde(default)]
    pub ws_single_read: bool,
}

#[derive(Debug, Serialize)]
pub struct IdResponse {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct CloneBody {
    pub new_mem_path: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct DeactivateResponse {
    pub recorded_offsets: Vec<u64>,
}

#[derive(Debug, Serialize)]
pub struct OffsetsResponse {
    pub recorded_offsets: Vec<u64>,
}

/// Tagged union over the Characterize family of requests (§6): `scanMincore`,
/// `emulateMincore`, `insertMincoreLayer`, `copyMincore`. Exactly one variant's fields are
/// present in a given request body, selected by the `op` discriminant.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum MincoreOp {
    ScanMincoreStart {
        #[serde(default)]
        pid_for_rss: Option<u32>,
        #[serde(default)]
        interval_ms: Option<u64>,
        #[serde(default)]
        size_incr_bytes: Option<u64>,
    },
    ScanMincoreStop,
    EmulateMincore {
        #[serde(default)]
        layer_size: Option<u32>,
    },
    InsertMincoreLayer {
        from_diff_id: String,
        position: u32,
    },
    CopyMincore {
        src_id: String,
    },
}

#[derive(Debug, Deserialize)]
pub struct CacheBody {
    #[serde(default)]
    pub dig_hole: bool,
    #[serde(default)]
    pub load_cache: bool,
    #[serde(default)]
    pub drop_cache: bool,
}

#[derive(Debug, Deserialize)]
pub struct RegionsBody {
    pub size_threshold: usize,
    pub interval_threshold: usize,
}

#[derive(Debug, Deserialize)]
pub struct WsBody {
    pub path: PathBuf,
    #[serde(default)]
    pub with_inactive: bool,
    #[serde(default)]
    pub with_zero: bool,
    pub size_threshold: usize,
    pub interval_threshold: usize,
}

#[derive(Debug, Deserialize)]
pub struct PrewarmBody {
    pub layers: Vec<u32>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct SummaryResponse {
    pub n_layers: u32,
    pub n_nz_regions: usize,
    pub nz_region_size: u64,
    pub n_ws_regions: usize,
    pub ws_region_size: u64,
}

impl From<reap_engine::MincoreSummary> for SummaryResponse {
    fn from(s: reap_engine::MincoreSummary) -> Self {
        SummaryResponse {
            n_layers: s.n_layers,
            n_nz_regions: s.n_nz_regions,
            nz_region_size: s.nz_region_size,
            n_ws_regions: s.n_ws_regions,
            ws_region_size: s.ws_region_size,
        }
    }
}
