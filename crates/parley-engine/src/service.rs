use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use parley_contracts::conversation::ImageData;
use parley_contracts::turn::HistoryTurn;

use crate::config::GeminiSettings;
use crate::dryrun::DryrunService;
use crate::gemini::GeminiService;

/// Lazily produced reply fragments, in arrival order.
pub type ChunkStream = Box<dyn Iterator<Item = Result<String>> + Send>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextRequest {
    pub model: String,
    pub system_instruction: Option<String>,
    pub history: Vec<HistoryTurn>,
    pub prompt: String,
}

impl TextRequest {
    pub fn single(model: &str, prompt: impl Into<String>) -> Self {
        Self {
            model: model.to_string(),
            system_instruction: None,
            history: Vec::new(),
            prompt: prompt.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageGenerationRequest {
    pub model: String,
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisionRequest {
    pub model: String,
    pub prompt: String,
    pub image: ImageData,
    /// Lets the reply carry an edited image as well as text.
    pub allow_image_output: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceReply {
    pub text: String,
    pub image: Option<ImageData>,
}

/// Remote generative model seam. Every call blocks the caller; streaming
/// hands back an iterator the caller drains at its own pace.
pub trait GenerativeService: Send + Sync {
    fn name(&self) -> &str;
    fn has_credentials(&self) -> bool;
    fn generate_text(&self, request: &TextRequest) -> Result<String>;
    fn stream_text(&self, request: &TextRequest) -> Result<ChunkStream>;
    fn generate_image(&self, request: &ImageGenerationRequest) -> Result<ServiceReply>;
    fn understand_image(&self, request: &VisionRequest) -> Result<ServiceReply>;
}

#[derive(Default)]
pub struct ServiceRegistry {
    services: BTreeMap<String, Arc<dyn GenerativeService>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<S: GenerativeService + 'static>(&mut self, service: S) {
        self.services
            .insert(service.name().to_string(), Arc::new(service));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn GenerativeService>> {
        self.services.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }
}

pub fn default_service_registry(gemini: &GeminiSettings) -> Result<ServiceRegistry> {
    let mut registry = ServiceRegistry::new();
    registry.register(DryrunService);
    registry.register(GeminiService::new(gemini.clone())?);
    Ok(registry)
}
