//! Module specifications
//!
//! A `ModuleSpec` is the immutable, validated description of one module as
//! declared in the configuration document.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::module::value::Value;

/// Organizational tier a module is declared in
///
/// Tier carries no dependency constraint: connectors may cross tiers freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Hardware,
    Logic,
    Gui,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Hardware => "hardware",
            Tier::Logic => "logic",
            Tier::Gui => "gui",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hardware" => Ok(Tier::Hardware),
            "logic" => Ok(Tier::Logic),
            "gui" => Ok(Tier::Gui),
            other => Err(format!("unknown tier '{}'", other)),
        }
    }
}

/// Module specification parsed from configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleSpec {
    /// Module name (unique across the whole graph)
    pub name: String,
    /// Tier the module is declared in
    pub tier: Tier,
    /// Identifier of the implementation to construct
    pub class_id: String,
    /// Construction options
    #[serde(default)]
    pub options: BTreeMap<String, Value>,
    /// Connector name -> target module name
    #[serde(default)]
    pub connectors: BTreeMap<String, String>,
    /// Whether the remote access server may expose this module
    #[serde(default = "default_true")]
    pub allow_remote: bool,
}

fn default_true() -> bool {
    true
}

impl ModuleSpec {
    pub fn new(name: impl Into<String>, tier: Tier, class_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tier,
            class_id: class_id.into(),
            options: BTreeMap::new(),
            connectors: BTreeMap::new(),
            allow_remote: true,
        }
    }

    /// Builder-style: bind a connector
    pub fn connect(mut self, connector: impl Into<String>, target: impl Into<String>) -> Self {
        self.connectors.insert(connector.into(), target.into());
        self
    }

    /// Builder-style: set an option
    pub fn option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Builder-style: set remote visibility
    pub fn allow_remote(mut self, allow: bool) -> Self {
        self.allow_remote = allow;
        self
    }
}
