//! Remote catalog backend speaking Kodi JSON-RPC 2.0 over HTTP

use super::smart_playlist::SmartPlaylist;
use super::{CatalogBackend, CatalogEntry, MediaDetails};
use crate::config::CatalogConfig;
use crate::error::{Error, Result};
use crate::models::SourceKind;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::cell::Cell;
use std::time::Duration;
use tracing::debug;

const DIRECTORY_PROPERTIES: [&str; 12] = [
    "file", "title", "runtime", "showtitle", "season", "episode", "genre", "year", "director",
    "playcount", "rating", "studio",
];
const DETAIL_PROPERTIES: [&str; 6] = ["title", "runtime", "showtitle", "plot", "studio", "streamdetails"];

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize, Default)]
struct DirectoryResult {
    #[serde(default)]
    files: Vec<DirectoryItem>,
}

#[derive(Debug, Deserialize, Default)]
struct DirectoryItem {
    #[serde(default)]
    file: String,
    #[serde(default, rename = "type")]
    item_type: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    label: String,
    #[serde(default)]
    showtitle: String,
    #[serde(default)]
    season: i64,
    #[serde(default)]
    episode: i64,
    #[serde(default)]
    plot: String,
    #[serde(default)]
    thumbnail: String,
    #[serde(default)]
    studio: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct FileDetailsResult {
    #[serde(default)]
    filedetails: Option<FileDetails>,
}

#[derive(Debug, Deserialize, Default)]
struct FileDetails {
    #[serde(default)]
    title: String,
    #[serde(default)]
    showtitle: String,
    #[serde(default)]
    plot: String,
    #[serde(default)]
    runtime: i64,
    #[serde(default)]
    studio: Vec<String>,
    #[serde(default)]
    streamdetails: Option<StreamDetails>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamDetails {
    #[serde(default)]
    video: Vec<VideoStream>,
}

#[derive(Debug, Deserialize, Default)]
struct VideoStream {
    #[serde(default)]
    duration: i64,
}

pub struct JsonRpcCatalog {
    url: String,
    auth: Option<String>,
    agent: ureq::Agent,
    next_id: Cell<u64>,
}

impl JsonRpcCatalog {
    pub fn new(config: &CatalogConfig) -> Self {
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(config.rpc_timeout_secs)))
            .timeout_connect(Some(Duration::from_secs(10)))
            .build()
            .new_agent();
        let auth = (!config.rpc_username.is_empty()).then(|| {
            let pair = format!("{}:{}", config.rpc_username, config.rpc_password);
            format!("Basic {}", base64::engine::general_purpose::STANDARD.encode(pair))
        });
        Self {
            url: config.rpc_url.clone(),
            auth,
            agent,
            next_id: Cell::new(1),
        }
    }

    fn call(&self, method: &str, params: Value) -> Result<String> {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let body = request_body(method, params, id);
        debug!("JSON-RPC {} #{}", method, id);

        let mut request = self.agent.post(&self.url).header("Content-Type", "application/json");
        if let Some(auth) = &self.auth {
            request = request.header("Authorization", auth.as_str());
        }
        let mut response = request
            .send(body.as_bytes())
            .map_err(|e| Error::CatalogUnavailable(format!("{}: {}", self.url, e)))?;
        if response.status() != 200 {
            return Err(Error::CatalogUnavailable(format!(
                "{}: HTTP {}",
                self.url,
                response.status()
            )));
        }
        response
            .body_mut()
            .read_to_string()
            .map_err(|e| Error::CatalogUnavailable(format!("{}: {}", self.url, e)))
    }
}

pub fn request_body(method: &str, params: Value, id: u64) -> String {
    json!({"jsonrpc": "2.0", "method": method, "params": params, "id": id}).to_string()
}

fn parse_response<T: DeserializeOwned>(body: &str) -> Result<std::result::Result<Option<T>, String>> {
    let response: RpcResponse<T> = serde_json::from_str(body)
        .map_err(|e| Error::CatalogUnavailable(format!("malformed JSON-RPC reply: {}", e)))?;
    if let Some(err) = response.error {
        return Ok(Err(format!("{} (code {})", err.message, err.code)));
    }
    Ok(Ok(response.result))
}

fn text(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn number(value: i64) -> Option<u32> {
    (value >= 0).then_some(value as u32)
}

/// Entries of a `Files.GetDirectory` reply that fit `kind`
pub fn parse_directory(body: &str, kind: SourceKind) -> Result<Vec<CatalogEntry>> {
    let result: Option<DirectoryResult> = parse_response(body)?.map_err(Error::InvalidSource)?;
    let wanted = match kind {
        SourceKind::Episodic => "episode",
        SourceKind::Flat => "movie",
    };
    let episodic = kind == SourceKind::Episodic;
    Ok(result
        .unwrap_or_default()
        .files
        .into_iter()
        .filter(|item| item.item_type == wanted && !item.file.is_empty())
        .map(|item| {
            let file = item.file.replace('\\', "/");
            let title = text(item.title).or_else(|| text(item.label)).unwrap_or_else(|| super::file_name(&file));
            CatalogEntry {
                title,
                show_title: if episodic { text(item.showtitle) } else { None },
                season: if episodic { number(item.season) } else { None },
                episode: if episodic { number(item.episode) } else { None },
                description: text(item.plot),
                thumbnail: text(item.thumbnail),
                studio: item.studio.into_iter().find(|s| !s.trim().is_empty()),
                file,
            }
        })
        .collect())
}

/// Details from a `Files.GetFileDetails` reply. Runtime wins, the first
/// video stream's duration is the fallback.
pub fn parse_file_details(body: &str, kind: SourceKind) -> Result<Option<MediaDetails>> {
    let details = match parse_response::<FileDetailsResult>(body)? {
        Ok(Some(result)) => result.filedetails,
        Ok(None) => None,
        Err(message) => {
            debug!("File details unavailable: {}", message);
            None
        }
    };
    let Some(details) = details else {
        return Ok(None);
    };
    let stream_duration = details
        .streamdetails
        .as_ref()
        .and_then(|s| s.video.first())
        .map_or(0, |v| v.duration);
    let seconds = if details.runtime > 0 { details.runtime } else { stream_duration };
    let group_name = match kind {
        SourceKind::Episodic => text(details.showtitle),
        SourceKind::Flat => text(details.title),
    };
    Ok(Some(MediaDetails {
        duration_seconds: seconds.max(0) as u64,
        group_name,
        description: text(details.plot),
        studio: details.studio.into_iter().find(|s| !s.trim().is_empty()),
    }))
}

impl CatalogBackend for JsonRpcCatalog {
    fn name(&self) -> &'static str {
        "jsonrpc"
    }

    fn query(&self, playlist: &SmartPlaylist, kind: SourceKind) -> Result<Vec<CatalogEntry>> {
        let body = self.call(
            "Files.GetDirectory",
            json!({
                "directory": playlist.location,
                "media": "video",
                "properties": DIRECTORY_PROPERTIES,
            }),
        )?;
        parse_directory(&body, kind)
    }

    fn lookup(&self, filename: &str, directory: &str, kind: SourceKind) -> Result<Option<MediaDetails>> {
        let body = self.call(
            "Files.GetFileDetails",
            json!({
                "file": format!("{}{}", directory, filename),
                "media": "video",
                "properties": DETAIL_PROPERTIES,
            }),
        )?;
        parse_file_details(&body, kind)
    }
}
