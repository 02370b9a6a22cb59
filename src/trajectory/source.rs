//! Trajectory sources and the record normalization adapter.
//!
//! Recorders emit trajectories in a few shapes:
//!
//! - the trajectory object itself, or wrapped as `{"trajectory": {...}}`;
//! - steps as a decoded `steps` array or as a JSON-encoded `stepsJson` string;
//! - snake_case or camelCase keys.
//!
//! [`normalize_record`] folds all of these into the canonical [`Trajectory`]
//! before any conversion or scoring code sees the data.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::trajectory::types::{MarketOutcomes, Trajectory};

/// Where trajectories come from. Implementations own their I/O; the cache
/// calls [`TrajectorySource::load`] whenever it runs dry.
pub trait TrajectorySource {
    fn load(&self) -> Result<Vec<Trajectory>>;
}

// ---------------------------------------------------------------------------
// Normalization adapter
// ---------------------------------------------------------------------------

/// Normalize one raw record into a [`Trajectory`].
pub fn normalize_record(record: Value) -> Result<Trajectory> {
    let mut record = match record {
        Value::Object(mut map) => match map.remove("trajectory") {
            Some(inner @ Value::Object(_)) => inner,
            Some(other) => {
                map.insert("trajectory".into(), other);
                Value::Object(map)
            }
            None => Value::Object(map),
        },
        other => {
            return Err(Error::Validation(format!(
                "trajectory record must be a JSON object, got {}",
                json_kind(&other)
            )))
        }
    };

    let Value::Object(map) = &mut record else {
        return Err(Error::Validation("trajectory record is not an object".into()));
    };

    // Encoded step arrays take precedence only when no decoded array exists.
    if !map.contains_key("steps") {
        let encoded = map.remove("stepsJson").or_else(|| map.remove("steps_json"));
        if let Some(encoded) = encoded {
            let steps = match encoded {
                Value::String(text) if text.trim().is_empty() || text == "null" => {
                    Value::Array(Vec::new())
                }
                Value::String(text) => serde_json::from_str(&text)?,
                Value::Null => Value::Array(Vec::new()),
                array @ Value::Array(_) => array,
                other => {
                    return Err(Error::Validation(format!(
                        "stepsJson must be a string or array, got {}",
                        json_kind(&other)
                    )))
                }
            };
            map.insert("steps".into(), steps);
        }
    }

    let mut trajectory: Trajectory = serde_json::from_value(record)?;

    if trajectory.trajectory_id.is_empty() {
        trajectory.trajectory_id = if trajectory.id.is_empty() {
            let generated = uuid::Uuid::new_v4().to_string();
            debug!(trajectory_id = %generated, "record has no id, generated one");
            generated
        } else {
            trajectory.id.clone()
        };
    }
    if trajectory.id.is_empty() {
        trajectory.id = trajectory.trajectory_id.clone();
    }
    if trajectory.episode_length == 0 {
        trajectory.episode_length = trajectory.steps.len() as u32;
    }

    Ok(trajectory)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// JSON directory source
// ---------------------------------------------------------------------------

/// Reads every `*.json` file in a directory. Each file holds either a single
/// trajectory record or an array of them.
#[derive(Debug, Clone)]
pub struct JsonDirSource {
    dir: PathBuf,
    /// Skip trajectories without any usable LLM call.
    require_llm_calls: bool,
}

impl JsonDirSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            require_llm_calls: false,
        }
    }

    pub fn require_llm_calls(mut self, require: bool) -> Self {
        self.require_llm_calls = require;
        self
    }

    fn read_file(&self, path: &Path) -> Result<Vec<Trajectory>> {
        let text = std::fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&text)?;

        let records = match value {
            Value::Array(items) => items,
            other => vec![other],
        };

        let mut trajectories = Vec::with_capacity(records.len());
        for record in records {
            match normalize_record(record) {
                Ok(t) => trajectories.push(t),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping malformed trajectory record");
                }
            }
        }
        Ok(trajectories)
    }
}

impl TrajectorySource for JsonDirSource {
    fn load(&self) -> Result<Vec<Trajectory>> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut all = Vec::new();
        for path in &paths {
            let trajectories = self.read_file(path)?;
            debug!(path = %path.display(), count = trajectories.len(), "read trajectory file");
            all.extend(trajectories);
        }

        let before = all.len();
        if self.require_llm_calls {
            all.retain(has_llm_calls);
        }

        info!(
            dir = %self.dir.display(),
            files = paths.len(),
            loaded = all.len(),
            skipped = before - all.len(),
            "loaded trajectories"
        );
        Ok(all)
    }
}

/// Whether a trajectory recorded at least one call with both a prompt and a
/// response.
pub fn has_llm_calls(trajectory: &Trajectory) -> bool {
    trajectory
        .steps
        .iter()
        .flat_map(|s| s.llm_calls.iter())
        .any(|c| !c.user_prompt.trim().is_empty() && !c.response.trim().is_empty())
}

/// An in-memory source, used for tests and for callers that already hold
/// decoded trajectories.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    pub trajectories: Vec<Trajectory>,
}

impl TrajectorySource for MemorySource {
    fn load(&self) -> Result<Vec<Trajectory>> {
        Ok(self.trajectories.clone())
    }
}

// ---------------------------------------------------------------------------
// Market outcomes
// ---------------------------------------------------------------------------

/// Read ground-truth outcomes keyed by window id.
///
/// The file holds either an array of outcome records, each carrying its
/// `windowId`, or an object mapping window ids to outcome records.
pub fn load_outcomes(path: &Path) -> Result<HashMap<String, MarketOutcomes>> {
    let text = std::fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&text)?;

    let mut outcomes = HashMap::new();
    match value {
        Value::Array(items) => {
            for item in items {
                let o: MarketOutcomes = serde_json::from_value(item)?;
                if o.window_id.is_empty() {
                    return Err(Error::Validation(format!(
                        "outcome record without a window id in {}",
                        path.display()
                    )));
                }
                outcomes.insert(o.window_id.clone(), o);
            }
        }
        Value::Object(map) => {
            for (window_id, item) in map {
                let mut o: MarketOutcomes = serde_json::from_value(item)?;
                if o.window_id.is_empty() {
                    o.window_id = window_id.clone();
                }
                outcomes.insert(window_id, o);
            }
        }
        _ => {
            return Err(Error::Validation(format!(
                "{} must hold an array or object of market outcomes",
                path.display()
            )))
        }
    }

    info!(path = %path.display(), windows = outcomes.len(), "loaded market outcomes");
    Ok(outcomes)
}
