mod scenario;
mod scripted;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use tally_core::network::{RandomSource, SeededRandom, ThreadRandom};
use tally_core::store::keys;
use tally_core::{ClientState, RequestThrottle, SequentialQueue, TallyConfig};
use tracing::info;
use uuid::Uuid;

use crate::scenario::{read_json, ReplayScenario, SimulateScenario};
use crate::scripted::ScriptedTransport;

#[derive(Parser)]
#[command(name = "tally", about = "Drive tally's derived values and request queue from scenario files")]
struct Cli {
    /// TOML config file. Defaults to ./tally.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply store updates step by step and print every derived value
    Replay {
        /// Scenario JSON: {"steps": [[update, ...], ...]}
        scenario: PathBuf,
    },

    /// Print the retry schedule a request throttle would follow
    Backoff {
        /// Override the configured retry ceiling
        #[arg(long)]
        retries: Option<u32>,

        /// Seed for the randomized first wait
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Run scripted requests through a sequential queue
    Simulate {
        /// Scenario JSON with requests and per-command responses
        scenario: PathBuf,
    },
}

fn load_config(path: Option<&Path>) -> Result<TallyConfig, String> {
    let default_path = Path::new("tally.toml");
    let path = match path {
        Some(path) => path,
        None if default_path.exists() => default_path,
        None => {
            info!("no config file found, using defaults");
            return Ok(TallyConfig::default());
        }
    };
    let config = TallyConfig::load(path).map_err(|e| e.to_string())?;
    info!(path = %path.display(), "loaded configuration");
    Ok(config)
}

fn cmd_replay(config: &TallyConfig, scenario: &Path, out: &mut dyn Write) -> Result<(), String> {
    let scenario: ReplayScenario = read_json(scenario)?;
    let mut state = ClientState::new(config).map_err(|e| e.to_string())?;

    for (i, step) in scenario.steps.iter().enumerate() {
        state.apply_all(step).map_err(|e| format!("step {}: {e}", i + 1))?;
        writeln!(out, "== step {}", i + 1).map_err(|e| e.to_string())?;
        print_derived(&state, out)?;
    }
    Ok(())
}

fn print_derived(state: &ClientState, out: &mut dyn Write) -> Result<(), String> {
    for key in state.engine().keys() {
        let value = state
            .get(&keys::derived_key(key))
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        let pretty = serde_json::to_string_pretty(&value).map_err(|e| e.to_string())?;
        writeln!(out, "{key}: {pretty}").map_err(|e| e.to_string())?;
    }
    Ok(())
}

fn cmd_backoff(
    config: &TallyConfig,
    retries: Option<u32>,
    seed: Option<u64>,
    out: &mut dyn Write,
) -> Result<(), String> {
    let mut network = config.network.clone();
    if let Some(retries) = retries {
        network.max_request_retries = retries;
    }
    let random: Box<dyn RandomSource> = match seed {
        Some(seed) => Box::new(SeededRandom::new(seed)),
        None => Box::new(ThreadRandom),
    };
    let mut throttle = RequestThrottle::with_random("backoff", &network, random);

    let mut total = 0u64;
    for attempt in 1..=network.max_request_retries {
        let wait = throttle.get_request_wait_time();
        total = total.saturating_add(wait);
        writeln!(out, "retry {attempt}: wait {wait} ms (total {total} ms)")
            .map_err(|e| e.to_string())?;
    }
    writeln!(out, "retry {}: exhausted", network.max_request_retries.saturating_add(1))
        .map_err(|e| e.to_string())
}

async fn cmd_simulate(
    config: &TallyConfig,
    scenario: &Path,
    out: &mut dyn Write,
) -> Result<(), String> {
    let scenario: SimulateScenario = read_json(scenario)?;
    let mut state = ClientState::new(config).map_err(|e| e.to_string())?;
    state
        .apply_all(&scenario.initial)
        .map_err(|e| format!("initial data: {e}"))?;

    let transport = ScriptedTransport::new(scenario.responses);
    let mut queue = SequentialQueue::new("sequential", transport, config);
    if let Some(seed) = scenario.seed {
        let throttle = RequestThrottle::with_random(
            "sequential",
            &config.network,
            Box::new(SeededRandom::new(seed)),
        );
        queue = queue.with_throttle(throttle);
    }

    let commands: std::collections::HashMap<_, _> = scenario
        .requests
        .iter()
        .map(|r| (r.id, r.command.clone()))
        .collect();
    for request in scenario.requests {
        queue.push(&mut state, request).map_err(|e| e.to_string())?;
    }

    let report = queue.flush(&mut state).await;
    let command = |id: Uuid| commands.get(&id).map_or("?", String::as_str);
    for id in &report.succeeded {
        writeln!(out, "succeeded {} {id}", command(*id)).map_err(|e| e.to_string())?;
    }
    for (id, error) in &report.failed {
        writeln!(out, "failed {} {id}: {error}", command(*id)).map_err(|e| e.to_string())?;
    }
    writeln!(out, "remaining {}", queue.len()).map_err(|e| e.to_string())?;
    print_derived(&state, out)
}

#[tokio::main]
async fn main() {
    tally_core::telemetry::init_tracing("warn");
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    };

    let mut stdout = std::io::stdout().lock();
    let result = match cli.command {
        Commands::Replay { scenario } => cmd_replay(&config, &scenario, &mut stdout),
        Commands::Backoff { retries, seed } => cmd_backoff(&config, retries, seed, &mut stdout),
        Commands::Simulate { scenario } => cmd_simulate(&config, &scenario, &mut stdout).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tally_core::config::NetworkConfig;

    fn write_scenario(dir: &tempfile::TempDir, name: &str, value: serde_json::Value) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, serde_json::to_string(&value).unwrap()).unwrap();
        path
    }

    fn output(buf: Vec<u8>) -> String {
        String::from_utf8(buf).unwrap()
    }

    fn fast_config() -> TallyConfig {
        TallyConfig {
            network: NetworkConfig {
                min_retry_wait_ms: 1,
                max_random_retry_wait_ms: 2,
                max_retry_wait_ms: 4,
                max_request_retries: 2,
            },
            ..Default::default()
        }
    }

    #[test]
    fn replay_prints_derived_values_per_step() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_scenario(
            &dir,
            "replay.json",
            json!({"steps": [
                [
                    {"op": "set", "key": "report_1", "value": {"reportID": "1"}},
                    {"op": "set", "key": "reportActions_1", "value": {
                        "a1": {"reportActionID": "a1", "created": "2024-01-01", "message": [{"html": "hi"}]}
                    }}
                ],
                [{"op": "remove", "key": "report_1"}]
            ]}),
        );

        let mut buf = Vec::new();
        cmd_replay(&TallyConfig::default(), &path, &mut buf).unwrap();
        let text = output(buf);
        assert!(text.contains("== step 1"));
        assert!(text.contains("\"lastReportAction\": \"a1\""));
        let step_2 = text.split("== step 2").nth(1).unwrap();
        assert!(step_2.contains("reportMetadata: {}"));
    }

    #[test]
    fn replay_reports_bad_update() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_scenario(
            &dir,
            "bad.json",
            json!({"steps": [[
                {"op": "mergeCollection", "collection": "report_", "entries": {"other_1": {}}}
            ]]}),
        );
        let err = cmd_replay(&TallyConfig::default(), &path, &mut Vec::new()).unwrap_err();
        assert!(err.starts_with("step 1:"), "{err}");
    }

    #[test]
    fn backoff_schedule_is_seeded_and_ends_exhausted() {
        let mut first = Vec::new();
        cmd_backoff(&TallyConfig::default(), Some(3), Some(9), &mut first).unwrap();
        let mut second = Vec::new();
        cmd_backoff(&TallyConfig::default(), Some(3), Some(9), &mut second).unwrap();
        assert_eq!(first, second);

        let text = output(first);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("retry 1: wait "));
        assert_eq!(lines[3], "retry 4: exhausted");
    }

    #[tokio::test]
    async fn simulate_reports_each_request() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_scenario(
            &dir,
            "simulate.json",
            json!({
                "initial": [{"op": "set", "key": "report_1", "value": {"reportID": "1"}}],
                "requests": [
                    {"command": "AddComment", "optimisticData": [
                        {"op": "merge", "key": "reportActions_1", "value": {
                            "a1": {"reportActionID": "a1", "created": "2024-01-01", "message": [{"html": "hi"}]}
                        }}
                    ]},
                    {"command": "DeleteReport", "failureData": [
                        {"op": "merge", "key": "report_1", "value": {"errors": "could not delete"}}
                    ]}
                ],
                "responses": {
                    "AddComment": [{"error": {"name": "NetworkError", "message": "down"}}],
                    "DeleteReport": [{"error": {"name": "HttpError", "message": "forbidden", "status": 403}}]
                },
                "seed": 1
            }),
        );

        let mut buf = Vec::new();
        cmd_simulate(&fast_config(), &path, &mut buf).await.unwrap();
        let text = output(buf);
        assert!(text.contains("succeeded AddComment"), "{text}");
        assert!(text.contains("failed DeleteReport"), "{text}");
        assert!(text.contains("remaining 0"));
        assert!(text.contains("\"lastReportAction\": \"a1\""));
    }

    #[test]
    fn explicit_config_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(Some(dir.path().join("nope.toml").as_path())).unwrap_err();
        assert!(err.contains("nope.toml"), "{err}");
    }

    #[test]
    fn explicit_config_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tally.toml");
        std::fs::write(&path, "[network]\nmax_request_retries = 3\n").unwrap();
        let config = load_config(Some(path.as_path())).unwrap();
        assert_eq!(config.network.max_request_retries, 3);
    }
}
