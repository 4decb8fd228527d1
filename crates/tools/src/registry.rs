use std::collections::HashMap;

use cf_domain::{Error, Result, ToolDefinition};

/// Immutable lookup over the tool catalog, built once at engine
/// construction.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    tools: HashMap<String, ToolDefinition>,
}

impl ToolCatalog {
    pub fn new(tools: Vec<ToolDefinition>) -> Self {
        Self {
            tools: tools
                .into_iter()
                .map(|tool| (tool.name.clone(), tool))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Result<&ToolDefinition> {
        self.tools
            .get(name)
            .ok_or_else(|| Error::ToolNotFound(name.to_owned()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolDefinition> {
        self.tools.values()
    }
}
