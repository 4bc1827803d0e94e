//! Orchestrator builder with validation.

use super::Orchestrator;
use crate::config::OrchestratorConfig;
use crate::errors::{PhaseflowError, PipelineValidationError};
use crate::events::{EventSink, LoggingEventSink};
use crate::resources::{ProcResourceProbe, ResourceProbe};
use crate::stages::StageDescriptor;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Builder for a validated, fixed, linear stage list.
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    stages: Vec<StageDescriptor>,
    probe: Option<Arc<dyn ResourceProbe>>,
    sink: Option<Arc<dyn EventSink>>,
}

impl fmt::Debug for OrchestratorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorBuilder")
            .field("config", &self.config)
            .field("stages", &self.stages.iter().map(StageDescriptor::id).collect::<Vec<_>>())
            .field("custom_probe", &self.probe.is_some())
            .field("custom_sink", &self.sink.is_some())
            .finish()
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorBuilder {
    /// Creates a builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: OrchestratorConfig::default(),
            stages: Vec::new(),
            probe: None,
            sink: None,
        }
    }

    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Appends a stage. Stages run in the order they are added.
    #[must_use]
    pub fn stage(mut self, stage: StageDescriptor) -> Self {
        self.stages.push(stage);
        self
    }

    /// Appends several stages in order.
    #[must_use]
    pub fn stages(mut self, stages: impl IntoIterator<Item = StageDescriptor>) -> Self {
        self.stages.extend(stages);
        self
    }

    /// Sets the resource probe. Defaults to [`ProcResourceProbe`].
    #[must_use]
    pub fn resource_probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Sets the event sink. Defaults to [`LoggingEventSink`].
    #[must_use]
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Returns the number of stages added so far.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Validates the definition and builds the orchestrator.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseflowError::Config`] for an invalid configuration and
    /// [`PhaseflowError::Validation`] for an empty stage list, an invalid
    /// descriptor, or a duplicate stage id or output name.
    pub fn build(self) -> Result<Orchestrator, PhaseflowError> {
        self.config.validate()?;

        if self.stages.is_empty() {
            return Err(PipelineValidationError::new("Orchestrator has no stages").into());
        }

        let mut lookup: HashMap<String, usize> = HashMap::with_capacity(self.stages.len());
        let mut outputs: HashMap<&str, &str> = HashMap::with_capacity(self.stages.len());

        for (index, stage) in self.stages.iter().enumerate() {
            stage.validate()?;

            if lookup.insert(stage.id().to_string(), index).is_some() {
                return Err(PipelineValidationError::new(format!(
                    "Duplicate stage id '{}'",
                    stage.id()
                ))
                .with_stages(vec![stage.id().to_string()])
                .into());
            }

            if let Some(previous) = outputs.insert(stage.output_name(), stage.id()) {
                return Err(PipelineValidationError::new(format!(
                    "Stages '{}' and '{}' both declare output '{}'",
                    previous,
                    stage.id(),
                    stage.output_name()
                ))
                .with_stages(vec![previous.to_string(), stage.id().to_string()])
                .into());
            }
        }

        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(ProcResourceProbe::new()));
        let sink = self
            .sink
            .unwrap_or_else(|| Arc::new(LoggingEventSink::default()));

        Ok(Orchestrator::new(
            Arc::new(self.config),
            self.stages.into(),
            lookup,
            probe,
            sink,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceLimits;
    use serde_json::json;

    fn noop(id: &str) -> StageDescriptor {
        StageDescriptor::blocking(id, id.to_uppercase(), |_| Ok(json!(null)))
    }

    fn validation_message(result: Result<Orchestrator, PhaseflowError>) -> String {
        match result {
            Err(PhaseflowError::Validation(err)) => err.message,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_build_preserves_order_and_lookup() {
        let orchestrator = OrchestratorBuilder::new()
            .stage(noop("ingest"))
            .stages([noop("score"), noop("report")])
            .build()
            .unwrap();

        let ids: Vec<_> = orchestrator.stages().iter().map(StageDescriptor::id).collect();
        assert_eq!(ids, vec!["ingest", "score", "report"]);
        assert_eq!(orchestrator.stage("score").map(StageDescriptor::name), Some("SCORE"));
        assert!(orchestrator.stage("missing").is_none());
    }

    #[test]
    fn test_rejects_empty() {
        let message = validation_message(OrchestratorBuilder::new().build());
        assert!(message.contains("no stages"));
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        let message = validation_message(
            OrchestratorBuilder::new()
                .stage(noop("a"))
                .stage(noop("a").with_output_name("other"))
                .build(),
        );
        assert!(message.contains("Duplicate stage id 'a'"));
    }

    #[test]
    fn test_rejects_duplicate_output_names() {
        let message = validation_message(
            OrchestratorBuilder::new()
                .stage(noop("a").with_output_name("grid"))
                .stage(noop("b").with_output_name("grid"))
                .build(),
        );
        assert!(message.contains("output 'grid'"));
    }

    #[test]
    fn test_rejects_invalid_descriptor() {
        let message = validation_message(
            OrchestratorBuilder::new()
                .stage(noop("a").with_timeout(-1.0))
                .build(),
        );
        assert!(message.contains("non-positive timeout"));
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = OrchestratorConfig::default()
            .with_resources(ResourceLimits::default().with_workers(4, 2, 8));
        let result = OrchestratorBuilder::new().config(config).stage(noop("a")).build();
        assert!(matches!(result, Err(PhaseflowError::Config(_))));
    }
}
