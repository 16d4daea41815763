use super::registry::{ModelRegistry, ModelSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub model: ModelSpec,
    pub requested: Option<String>,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ModelSelector {
    pub registry: ModelRegistry,
}

impl ModelSelector {
    pub fn new(registry: Option<ModelRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_default(),
        }
    }

    pub fn select(
        &self,
        requested: Option<&str>,
        capability: &str,
    ) -> Result<ModelSelection, String> {
        self.select_from(None, requested, capability)
    }

    /// Resolves a model for `capability`, optionally restricted to one
    /// provider. An unknown or incapable request falls back to the first
    /// registered candidate and records why.
    pub fn select_from(
        &self,
        provider: Option<&str>,
        requested: Option<&str>,
        capability: &str,
    ) -> Result<ModelSelection, String> {
        let matches_provider =
            |model: &ModelSpec| provider.map(|name| model.provider == name).unwrap_or(true);

        let (fallback_reason, requested_text) = if let Some(requested_value) = requested {
            if let Some(model) = self
                .registry
                .ensure(requested_value, capability)
                .filter(|model| matches_provider(model))
            {
                return Ok(ModelSelection {
                    model,
                    requested: Some(requested_value.to_string()),
                    fallback_reason: None,
                });
            }
            (
                Some(format!(
                    "Requested model '{requested_value}' unavailable for capability '{capability}'."
                )),
                Some(requested_value.to_string()),
            )
        } else {
            (None, None)
        };

        let Some(model) = self
            .registry
            .by_capability(capability)
            .into_iter()
            .find(|model| matches_provider(model))
        else {
            return Err(match provider {
                Some(name) => format!(
                    "No {name} models available for capability '{capability}'."
                ),
                None => format!("No models available for capability '{capability}'."),
            });
        };
        Ok(ModelSelection {
            model,
            requested: requested_text,
            fallback_reason,
        })
    }
}
