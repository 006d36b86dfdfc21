use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Specialization of a worker. Fixed for the worker's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Researcher,
    Extractor,
    Validator,
    Writer,
}

impl AgentRole {
    pub const ALL: [AgentRole; 4] = [
        AgentRole::Researcher,
        AgentRole::Extractor,
        AgentRole::Validator,
        AgentRole::Writer,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Researcher => "researcher",
            AgentRole::Extractor => "extractor",
            AgentRole::Validator => "validator",
            AgentRole::Writer => "writer",
        }
    }

    pub fn default_capabilities(self) -> Vec<String> {
        let caps: &[&str] = match self {
            AgentRole::Researcher => &["web_search", "source_discovery", "summarization"],
            AgentRole::Extractor => &["data_extraction", "parsing", "structuring"],
            AgentRole::Validator => &["fact_checking", "data_validation", "quality_review"],
            AgentRole::Writer => &["content_writing", "editing", "formatting"],
        };
        caps.iter().map(|cap| cap.to_string()).collect()
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentRole::ALL
            .into_iter()
            .find(|role| role.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown agent role: {s}"))
    }
}
