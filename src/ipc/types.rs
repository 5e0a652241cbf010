use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

/// One line of the stdio protocol: `{ id, method, params }`. The id is
/// echoed back so the caller can correlate responses.
#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Both fields stay `None` until `workspace.select` opens a roster database.
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
}
