use tracing::info;

use crate::{
    config::PipelineOptions,
    family::PromptCachePolicy,
    runtime::{PromptEmbeddings, PromptRequest},
};

#[derive(Clone, Debug, PartialEq, Eq)]
struct PromptKey {
    prompt: String,
    negative_prompt: Option<String>,
    guidance: Option<bool>,
}

/// Single-slot cache of the last prompt encoding.
#[derive(Debug)]
pub struct PromptCache {
    policy: PromptCachePolicy,
    slot: Option<(PromptKey, PromptEmbeddings)>,
}

impl PromptCache {
    pub fn new(policy: PromptCachePolicy) -> Self {
        Self { policy, slot: None }
    }

    fn key(&self, options: &PipelineOptions) -> PromptKey {
        PromptKey {
            prompt: options.prompt.clone(),
            negative_prompt: options.negative_prompt.clone(),
            guidance: (self.policy == PromptCachePolicy::PromptsAndGuidance)
                .then(|| options.guidance_enabled()),
        }
    }

    /// Return the cached embeddings when the key matches, otherwise run `encode` and keep its result.
    pub fn get_or_encode(
        &mut self,
        options: &PipelineOptions,
        encode: impl FnOnce(&PromptRequest) -> anyhow::Result<PromptEmbeddings>,
    ) -> anyhow::Result<PromptEmbeddings> {
        let request = PromptRequest {
            prompt: options.prompt.clone(),
            negative_prompt: options.negative_prompt.clone(),
            guidance: options.guidance_enabled(),
        };
        if self.policy == PromptCachePolicy::Off {
            info!("[Generate] Encoding prompt");
            return encode(&request);
        }

        let key = self.key(options);
        if let Some((cached, embeddings)) = &self.slot {
            if *cached == key {
                return Ok(embeddings.clone());
            }
        }
        info!("[Generate] Encoding prompt");
        // Drop the stale entry before encoding so a failure leaves nothing cached.
        self.slot = None;
        let embeddings = encode(&request)?;
        self.slot = Some((key, embeddings.clone()));
        Ok(embeddings)
    }

    pub fn invalidate(&mut self) {
        self.slot = None;
    }

    pub fn is_empty(&self) -> bool {
        self.slot.is_none()
    }
}
