use std::collections::HashMap;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tally_core::{Request, RequestError, Response, StoreUpdate};

/// Store updates applied step by step through the derived value engine.
#[derive(Debug, Deserialize)]
pub struct ReplayScenario {
    pub steps: Vec<Vec<StoreUpdate>>,
}

/// Requests pushed onto a sequential queue, answered from a per-command
/// script.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulateScenario {
    /// Store contents before any request is pushed.
    #[serde(default)]
    pub initial: Vec<StoreUpdate>,
    pub requests: Vec<Request>,
    /// Outcomes per command, consumed in order. Commands without a script,
    /// or whose script ran out, succeed.
    #[serde(default)]
    pub responses: HashMap<String, Vec<Outcome>>,
    /// Seed for the throttle's first wait. Random when absent.
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Outcome {
    Response(Response),
    Error(RequestError),
}

impl From<Outcome> for Result<Response, RequestError> {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Response(response) => Ok(response),
            Outcome::Error(error) => Err(error),
        }
    }
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, String> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    serde_json::from_str(&contents).map_err(|e| format!("cannot parse {}: {e}", path.display()))
}
