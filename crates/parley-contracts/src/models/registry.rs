use indexmap::IndexMap;

pub const CAPABILITY_TEXT: &str = "text";
pub const CAPABILITY_VISION: &str = "vision";
pub const CAPABILITY_IMAGE: &str = "image";
pub const CAPABILITY_EDIT: &str = "edit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    pub capabilities: Vec<String>,
    pub context_window: Option<u64>,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }
}

/// Known models in preference order; the first match for a capability is
/// the default.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn by_capability(&self, capability: &str) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .cloned()
            .collect()
    }

    pub fn ensure(&self, name: &str, capability: &str) -> Option<ModelSpec> {
        let model = self.get(name)?;
        if model.supports(capability) {
            return Some(model.clone());
        }
        None
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert =
        |name: &str, provider: &str, capabilities: &[&str], context_window: Option<u64>| {
            map.insert(
                name.to_string(),
                ModelSpec {
                    name: name.to_string(),
                    provider: provider.to_string(),
                    capabilities: capabilities
                        .iter()
                        .map(|item| (*item).to_string())
                        .collect(),
                    context_window,
                },
            );
        };

    insert(
        "gemini-2.0-flash",
        "gemini",
        &[CAPABILITY_TEXT, CAPABILITY_VISION],
        Some(1_048_576),
    );
    insert(
        "gemini-2.5-flash",
        "gemini",
        &[CAPABILITY_TEXT, CAPABILITY_VISION],
        Some(1_048_576),
    );
    insert(
        "gemini-1.5-flash",
        "gemini",
        &[CAPABILITY_TEXT, CAPABILITY_VISION],
        Some(1_048_576),
    );
    insert(
        "gemini-2.0-flash-preview-image-generation",
        "gemini",
        &[CAPABILITY_IMAGE, CAPABILITY_EDIT],
        Some(32_768),
    );
    insert(
        "gemini-2.5-flash-image",
        "gemini",
        &[CAPABILITY_IMAGE, CAPABILITY_EDIT],
        Some(32_768),
    );
    insert(
        "dryrun-text-1",
        "dryrun",
        &[CAPABILITY_TEXT, CAPABILITY_VISION],
        Some(8192),
    );
    insert(
        "dryrun-image-1",
        "dryrun",
        &[CAPABILITY_IMAGE, CAPABILITY_EDIT],
        None,
    );

    map
}

#[cfg(test)]
mod tests {
    use super::{
        ModelRegistry, CAPABILITY_EDIT, CAPABILITY_IMAGE, CAPABILITY_TEXT, CAPABILITY_VISION,
    };

    #[test]
    fn registry_orders_gemini_before_dryrun() {
        let registry = ModelRegistry::default();
        let text = registry.by_capability(CAPABILITY_TEXT);
        assert_eq!(text[0].name, "gemini-2.0-flash");
        assert!(text.iter().any(|model| model.provider == "dryrun"));
    }

    #[test]
    fn ensure_checks_capability() {
        let registry = ModelRegistry::default();
        assert!(registry.ensure("gemini-2.5-flash", CAPABILITY_VISION).is_some());
        assert!(registry.ensure("gemini-2.5-flash", CAPABILITY_IMAGE).is_none());
        assert!(registry.ensure("missing", CAPABILITY_TEXT).is_none());
        assert!(registry
            .ensure("gemini-2.5-flash-image", CAPABILITY_EDIT)
            .is_some());
    }
}
