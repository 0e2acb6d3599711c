//! Query parameter DTOs for the control surface.

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct FetchQuery {
    #[serde(rename = "src-file-path")]
    pub src_file_path: String,
    #[serde(rename = "dst-file-path")]
    pub dst_file_path: String,
    pub uuid: String,
    #[serde(rename = "disk-uuid", default)]
    pub disk_uuid: String,
    #[serde(rename = "expected-checksum", default)]
    pub expected_checksum: String,
    pub size: u64,
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    #[serde(rename = "file-path")]
    pub file_path: String,
    pub uuid: String,
    pub url: String,
    #[serde(rename = "disk-uuid", default)]
    pub disk_uuid: String,
    #[serde(rename = "expected-checksum", default)]
    pub expected_checksum: String,
    #[serde(rename = "data-engine", default)]
    pub data_engine: String,
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    #[serde(rename = "file-path")]
    pub file_path: String,
    pub uuid: String,
    #[serde(rename = "disk-uuid", default)]
    pub disk_uuid: String,
    #[serde(rename = "expected-checksum", default)]
    pub expected_checksum: String,
    pub size: u64,
    #[serde(rename = "data-engine", default)]
    pub data_engine: String,
}

#[derive(Debug, Deserialize)]
pub struct ReceiveQuery {
    #[serde(rename = "file-path")]
    pub file_path: String,
    pub uuid: String,
    #[serde(rename = "disk-uuid", default)]
    pub disk_uuid: String,
    #[serde(rename = "expected-checksum", default)]
    pub expected_checksum: String,
    #[serde(rename = "file-type", default)]
    pub file_type: String,
    pub size: u64,
    pub port: u16,
    #[serde(rename = "data-engine", default)]
    pub data_engine: String,
}

#[derive(Debug, Deserialize)]
pub struct SendQuery {
    #[serde(rename = "to-address")]
    pub to_address: String,
}

#[derive(Debug, Deserialize)]
pub struct CloneQuery {
    #[serde(rename = "file-path")]
    pub file_path: String,
    pub uuid: String,
    #[serde(rename = "disk-uuid", default)]
    pub disk_uuid: String,
    #[serde(rename = "expected-checksum", default)]
    pub expected_checksum: String,
    #[serde(rename = "backing-image")]
    pub backing_image: String,
    #[serde(rename = "backing-image-uuid")]
    pub backing_image_uuid: String,
    pub encryption: String,
    #[serde(rename = "data-engine", default)]
    pub data_engine: String,
}

#[derive(Debug, Deserialize)]
pub struct RestoreQuery {
    #[serde(rename = "file-path")]
    pub file_path: String,
    pub uuid: String,
    #[serde(rename = "disk-uuid", default)]
    pub disk_uuid: String,
    #[serde(rename = "expected-checksum", default)]
    pub expected_checksum: String,
    #[serde(rename = "backup-url")]
    pub backup_url: String,
    #[serde(rename = "concurrent-limit")]
    pub concurrent_limit: usize,
    #[serde(rename = "data-engine", default)]
    pub data_engine: String,
}

#[derive(Debug, Deserialize)]
pub struct DownloadToDstQuery {
    #[serde(rename = "forV2Creation", default)]
    pub for_v2_creation: bool,
}
