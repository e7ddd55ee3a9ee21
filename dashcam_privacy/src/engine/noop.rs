use super::{
    BoxConvention, EngineFactory, InferenceEngine, InferenceError, ModelInput, ModelMetadata, ModelVariant, RawOutput,
};

/// Engine that never detects anything. Lets the daemon run end to end without a
/// native runtime; every frame is committed with empty detections.
pub struct NoOpEngine {
    metadata: ModelMetadata,
}

impl NoOpEngine {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            metadata: ModelMetadata {
                input_size: None,
                num_classes: 1,
                box_convention: BoxConvention::Normalized,
                version: version.into(),
            },
        }
    }
}

impl InferenceEngine for NoOpEngine {
    fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    fn infer(&mut self, _input: &ModelInput) -> Result<RawOutput, InferenceError> {
        Ok(RawOutput::empty(self.metadata.num_classes))
    }
}

pub struct NoOpEngineFactory {
    version: String,
}

impl NoOpEngineFactory {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
        }
    }
}

impl EngineFactory for NoOpEngineFactory {
    fn create(&self, _variant: ModelVariant) -> Result<Box<dyn InferenceEngine>, InferenceError> {
        Ok(Box::new(NoOpEngine::new(self.version.clone())))
    }
}
