//! Raw source tree consumed by the tree flattener.
//!
//! # Responsibility
//! - Define the one node shape every source adapter produces.
//! - Classify level tags into the canonical five and everything else.
//!
//! # Invariants
//! - Child order is source order; nothing downstream reorders children.
//! - `responses`/`stimuli` are only meaningful on epoch nodes.

use crate::model::value::{Value, ValueMap};

/// Hierarchy level tag of a raw node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Level {
    Experiment,
    Cell,
    EpochGroup,
    EpochBlock,
    Epoch,
    /// Any level that is not retained in the canonical document
    /// (animal, preparation, ...). Stored lowercase.
    Other(String),
}

impl Level {
    /// Classifies a level tag.
    ///
    /// Matching ignores case and `_`, `-`, space separators, so
    /// `epoch_group`, `EpochGroup` and `epoch-group` are the same level.
    pub fn parse(tag: &str) -> Self {
        let compact: String = tag
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .collect::<String>()
            .to_ascii_lowercase();
        match compact.as_str() {
            "experiment" => Self::Experiment,
            "cell" => Self::Cell,
            "epochgroup" => Self::EpochGroup,
            "epochblock" => Self::EpochBlock,
            "epoch" => Self::Epoch,
            _ => Self::Other(tag.trim().to_ascii_lowercase()),
        }
    }

    /// Returns whether this level is kept as its own node in the document.
    pub fn is_canonical(&self) -> bool {
        !matches!(self, Self::Other(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Experiment => "experiment",
            Self::Cell => "cell",
            Self::EpochGroup => "epoch_group",
            Self::EpochBlock => "epoch_block",
            Self::Epoch => "epoch",
            Self::Other(name) => name.as_str(),
        }
    }
}

/// One node of a source tree.
#[derive(Debug, Clone, PartialEq)]
pub struct RawNode {
    pub level: Level,
    /// Row payload for this node.
    pub object: ValueMap,
    pub children: Vec<RawNode>,
    /// Raw tag records; only `user` and `tag` survive flattening.
    pub tags: Vec<ValueMap>,
    pub responses: Vec<ValueMap>,
    pub stimuli: Vec<ValueMap>,
}

impl RawNode {
    pub fn new(level: Level) -> Self {
        Self {
            level,
            object: ValueMap::new(),
            children: Vec::new(),
            tags: Vec::new(),
            responses: Vec::new(),
            stimuli: Vec::new(),
        }
    }

    pub fn with_object(mut self, object: ValueMap) -> Self {
        self.object = object;
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.object.insert(key.into(), value.into());
        self
    }

    pub fn with_child(mut self, child: RawNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_tag(mut self, user: &str, tag: &str) -> Self {
        let mut record = ValueMap::new();
        record.insert("user".to_string(), Value::from(user));
        record.insert("tag".to_string(), Value::from(tag));
        self.tags.push(record);
        self
    }

    pub fn with_response(mut self, response: ValueMap) -> Self {
        self.responses.push(response);
        self
    }

    pub fn with_stimulus(mut self, stimulus: ValueMap) -> Self {
        self.stimuli.push(stimulus);
        self
    }

    /// Returns a payload field, treating absence and null alike.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.object.get(key).filter(|value| !value.is_missing())
    }
}
