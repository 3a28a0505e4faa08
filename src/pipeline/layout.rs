//! Pipeline layout: which pools exist, which stages exist, and how they bind.
//!
//! Read from the TOML config file:
//!
//! ```toml
//! [SEDA_BASE]
//! ThreadPools = ["SQLThreads", "DefaultThreads"]
//! STAGES = "SessionStage, EchoStage"
//! EventHistory = false
//! MaxEventHistoryNum = 100
//!
//! [SQLThreads]
//! count = 3
//!
//! [SessionStage]
//! ThreadId = "SQLThreads"
//! NextStages = ["EchoStage"]
//! ```

use std::collections::HashSet;
use std::time::Duration;

use toml::{Table, Value};

use super::stage::HistoryPolicy;
use crate::error::PipelineError;

pub const BASE_SECTION: &str = "SEDA_BASE";
pub const DEFAULT_POOL: &str = "DefaultThreads";
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSpec {
    pub name: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageSpec {
    pub name: String,
    /// Factory key; defaults to the stage name.
    pub kind: String,
    pub pool: String,
    pub next: Vec<String>,
    /// The stage's whole section, for stage-specific keys.
    pub section: Table,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineLayout {
    pub pools: Vec<PoolSpec>,
    pub stages: Vec<StageSpec>,
    pub history: HistoryPolicy,
    pub sweep_interval: Duration,
}

impl PipelineLayout {
    pub fn from_toml_str(text: &str) -> Result<Self, PipelineError> {
        let table: Table =
            toml::from_str(text).map_err(|e| PipelineError::Parse(e.to_string()))?;
        Self::parse(&table)
    }

    /// Read the layout from a parsed config document.
    pub fn parse(doc: &Table) -> Result<Self, PipelineError> {
        let base = section(doc, BASE_SECTION)?;

        let pool_names = list(base, BASE_SECTION, "ThreadPools")?;
        if pool_names.is_empty() {
            return Err(parse_err(BASE_SECTION, "ThreadPools", "no thread pools defined"));
        }
        let mut pools = Vec::with_capacity(pool_names.len());
        let mut seen = HashSet::new();
        for name in pool_names {
            if !seen.insert(name.clone()) {
                return Err(parse_err(BASE_SECTION, "ThreadPools", &format!("pool '{name}' listed twice")));
            }
            let sec = section(doc, &name)?;
            let count = match sec.get("count") {
                Some(v) => positive_int(v, &name, "count")?,
                None => return Err(parse_err(&name, "count", "missing")),
            };
            pools.push(PoolSpec { name, count });
        }

        let stage_names = list(base, BASE_SECTION, "STAGES")?;
        let mut stages = Vec::with_capacity(stage_names.len());
        let mut seen = HashSet::new();
        for name in stage_names {
            if !seen.insert(name.clone()) {
                return Err(parse_err(BASE_SECTION, "STAGES", &format!("stage '{name}' listed twice")));
            }
            let sec = match doc.get(&name) {
                Some(Value::Table(t)) => t.clone(),
                Some(_) => return Err(parse_err(&name, "", "section is not a table")),
                None => Table::new(),
            };
            let pool = match sec.get("ThreadId") {
                Some(v) => string(v, &name, "ThreadId")?,
                None => DEFAULT_POOL.to_string(),
            };
            let kind = match sec.get("Type") {
                Some(v) => string(v, &name, "Type")?,
                None => name.clone(),
            };
            let next = list(&sec, &name, "NextStages")?;
            stages.push(StageSpec {
                name,
                kind,
                pool,
                next,
                section: sec,
            });
        }

        let history = HistoryPolicy {
            enabled: match base.get("EventHistory") {
                Some(v) => boolean(v, BASE_SECTION, "EventHistory")?,
                None => false,
            },
            max_hops: match base.get("MaxEventHistoryNum") {
                Some(v) => positive_int(v, BASE_SECTION, "MaxEventHistoryNum")?,
                None => HistoryPolicy::default().max_hops,
            },
        };
        let sweep_interval = match base.get("SweepIntervalMs") {
            Some(v) => Duration::from_millis(positive_int(v, BASE_SECTION, "SweepIntervalMs")? as u64),
            None => DEFAULT_SWEEP_INTERVAL,
        };

        Ok(Self {
            pools,
            stages,
            history,
            sweep_interval,
        })
    }

    /// Whether `doc` carries a pipeline definition at all.
    pub fn is_defined_in(doc: &Table) -> bool {
        doc.contains_key(BASE_SECTION)
    }

    /// Built-in pipeline used when the config file defines none.
    pub fn builtin() -> Self {
        let pools = ["SQLThreads", "IOThreads", DEFAULT_POOL]
            .into_iter()
            .map(|name| PoolSpec {
                name: name.to_string(),
                count: 3,
            })
            .collect();
        Self {
            pools,
            stages: vec![StageSpec {
                name: "SessionStage".to_string(),
                kind: "SessionStage".to_string(),
                pool: "SQLThreads".to_string(),
                next: Vec::new(),
                section: Table::new(),
            }],
            history: HistoryPolicy::default(),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    pub fn pool(&self, name: &str) -> Option<&PoolSpec> {
        self.pools.iter().find(|p| p.name == name)
    }
}

fn parse_err(section: &str, key: &str, msg: &str) -> PipelineError {
    if key.is_empty() {
        PipelineError::Parse(format!("[{section}]: {msg}"))
    } else {
        PipelineError::Parse(format!("[{section}] {key}: {msg}"))
    }
}

fn section<'a>(doc: &'a Table, name: &str) -> Result<&'a Table, PipelineError> {
    match doc.get(name) {
        Some(Value::Table(t)) => Ok(t),
        Some(_) => Err(parse_err(name, "", "section is not a table")),
        None => Err(parse_err(name, "", "section missing")),
    }
}

/// A TOML array of strings, or one comma-delimited string. Absent means empty.
fn list(sec: &Table, section: &str, key: &str) -> Result<Vec<String>, PipelineError> {
    let items: Vec<String> = match sec.get(key) {
        None => return Ok(Vec::new()),
        Some(Value::String(s)) => s.split(',').map(|p| p.trim().to_string()).collect(),
        Some(Value::Array(values)) => values
            .iter()
            .map(|v| match v {
                Value::String(s) => Ok(s.trim().to_string()),
                other => Err(parse_err(section, key, &format!("expected string, got {}", other.type_str()))),
            })
            .collect::<Result<_, _>>()?,
        Some(other) => {
            return Err(parse_err(section, key, &format!("expected list, got {}", other.type_str())));
        }
    };
    Ok(items.into_iter().filter(|s| !s.is_empty()).collect())
}

fn string(v: &Value, section: &str, key: &str) -> Result<String, PipelineError> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Value::String(_) => Err(parse_err(section, key, "empty")),
        other => Err(parse_err(section, key, &format!("expected string, got {}", other.type_str()))),
    }
}

fn positive_int(v: &Value, section: &str, key: &str) -> Result<usize, PipelineError> {
    let n = match v {
        Value::Integer(n) => *n,
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| parse_err(section, key, &format!("'{s}' is not a number")))?,
        other => {
            return Err(parse_err(section, key, &format!("expected integer, got {}", other.type_str())));
        }
    };
    if n < 1 {
        return Err(parse_err(section, key, &format!("must be at least 1, got {n}")));
    }
    Ok(n as usize)
}

fn boolean(v: &Value, section: &str, key: &str) -> Result<bool, PipelineError> {
    match v {
        Value::Boolean(b) => Ok(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(parse_err(section, key, &format!("'{s}' is not a boolean"))),
        },
        other => Err(parse_err(section, key, &format!("expected boolean, got {}", other.type_str()))),
    }
}
