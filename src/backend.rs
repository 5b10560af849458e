use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    /// Token count reported by the backend at the end of the stream, if any.
    pub eval_count: Option<u64>,
    pub chunks: u64,
}

impl StreamStats {
    pub fn tokens(&self) -> u64 {
        self.eval_count.unwrap_or(self.chunks)
    }
}

pub type TokenSink<'a> = &'a mut (dyn FnMut(&str) + Send);

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn list_models(&self) -> Result<Vec<String>>;

    async fn health_check(&self, model: &str) -> bool;

    /// Streams a completion, handing every text chunk to `on_token` as it arrives.
    async fn stream_generate(
        &self,
        model: &str,
        prompt: &str,
        on_token: TokenSink<'_>,
    ) -> Result<StreamStats>;

    async fn generate(&self, model: &str, prompt: &str, system: Option<&str>) -> Result<String>;
}
