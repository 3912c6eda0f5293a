//! Entities and their provenance-tagged operation log.
//!
//! Every field assignment on an entity is recorded as an [`Op`] and never discarded.
//! The resolved value of a path within one system follows a fixed merge rule:
//! an `Explicit` op always applies; an `Inferred` op applies only while no `Explicit`
//! op has been applied to the same path in the same system.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The default state layer onto which other systems are overlaid.
pub const BASELINE_SYSTEM: &str = "baseline";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OpSource {
    /// Asserted by the user or the system itself.
    Explicit,
    /// Inferred from the live environment.
    Inferred,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Set,
    Unset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Op {
    pub op: OpKind,
    pub source: OpSource,
    pub path: Vec<String>,
    #[serde(default)]
    pub value: Value,
    pub system: String,
}

impl Op {
    pub fn set<P, S>(source: OpSource, path: P, value: Value, system: &str) -> Self
    where
        P: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            op: OpKind::Set,
            source,
            path: path.into_iter().map(Into::into).collect(),
            value,
            system: system.to_string(),
        }
    }

    pub fn unset<P, S>(source: OpSource, path: P, system: &str) -> Self
    where
        P: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            op: OpKind::Unset,
            source,
            path: path.into_iter().map(Into::into).collect(),
            value: Value::Null,
            system: system.to_string(),
        }
    }

    /// Inferred `set` on the baseline system.
    pub fn inferred<P, S>(path: P, value: Value) -> Self
    where
        P: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::set(OpSource::Inferred, path, value, BASELINE_SYSTEM)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
    pub id: String,
    pub entity_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ops: Vec<Op>,
}

impl EntityRef {
    /// New entity with a fresh identifier.
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            id: format!("entity:{}", Uuid::new_v4()),
            entity_type: entity_type.into(),
            name: String::new(),
            ops: Vec::new(),
        }
    }

    pub fn named(entity_type: impl Into<String>, name: impl Into<String>) -> Self {
        let mut e = Self::new(entity_type);
        e.name = name.into();
        e
    }

    /// Append an op to the log. The log is never rewritten.
    pub fn add_op(&mut self, op: Op) { self.ops.push(op); }

    /// Resolve every path of a single system, applying the merge rule.
    /// Paths with an empty segment list are ignored.
    pub fn resolved(&self, system: &str) -> BTreeMap<Vec<String>, Value> {
        let mut explicit: HashSet<&[String]> = HashSet::new();
        let mut out: BTreeMap<Vec<String>, Value> = BTreeMap::new();
        for op in self.ops.iter().filter(|o| o.system == system && !o.path.is_empty()) {
            match op.source {
                OpSource::Inferred if explicit.contains(op.path.as_slice()) => continue,
                OpSource::Explicit => {
                    explicit.insert(op.path.as_slice());
                }
                OpSource::Inferred => {}
            }
            match op.op {
                OpKind::Set => {
                    out.insert(op.path.clone(), op.value.clone());
                }
                OpKind::Unset => {
                    out.remove(&op.path);
                }
            }
        }
        out
    }

    /// Value of one path as seen from `system`: the system's own value, else the baseline's.
    pub fn value(&self, path: &[&str], system: &str) -> Option<Value> {
        let key: Vec<String> = path.iter().map(|s| s.to_string()).collect();
        if system != BASELINE_SYSTEM {
            if let Some(v) = self.resolved(system).remove(&key) {
                return Some(v);
            }
        }
        self.resolved(BASELINE_SYSTEM).remove(&key)
    }

    /// Materialize the properties tree for `system` (baseline first, then the overlay).
    pub fn properties(&self, system: &str) -> Value {
        let mut root = Value::Object(serde_json::Map::new());
        for (path, value) in self.resolved(BASELINE_SYSTEM) {
            set_path(&mut root, &path, value);
        }
        if system != BASELINE_SYSTEM {
            for (path, value) in self.resolved(system) {
                set_path(&mut root, &path, value);
            }
        }
        root
    }
}

fn set_path(root: &mut Value, path: &[String], value: Value) {
    let Some((last, parents)) = path.split_last() else { return };
    let mut cur = root;
    for seg in parents {
        if !cur.is_object() {
            *cur = Value::Object(serde_json::Map::new());
        }
        cur = match cur {
            Value::Object(map) => map.entry(seg.clone()).or_insert(Value::Null),
            _ => return,
        };
    }
    if !cur.is_object() {
        *cur = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(map) = cur {
        map.insert(last.clone(), value);
    }
}
