//! Copyright © 2025-2026 Veld Team. All Rights Reserved.
//!
//! This file is part of Veld.
//! The Veld project belongs to the Veld Team.
//!
//! Licensed under the Apache License, Version 2.0 (the "License");
//! You may not use this file except in compliance with the License.
//! You may obtain a copy of the License at
//!
//!     http://www.apache.org/licenses/LICENSE-2.0
//!
//! Unless required by applicable law or agreed to in writing, software
//! distributed under the License is distributed on an "AS IS" BASIS,
//! WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//! See the License for the specific language governing permissions and
//! limitations under the License.

//! # Veld Pipeline Module
//!
//! A pipeline is an ordered sequence of primitive stages, produced by the
//! builder after composite decomposition and immutable once validated.
//! Validation walks the decomposed stage list and checks that each stage's
//! declared inputs are satisfied by the previous stage's declared outputs,
//! failing fast with the first unsatisfied stage before any worker starts.

use std::collections::HashSet;
use std::sync::Arc;

use crate::errors::{Result, VeldError};
use crate::stage::{VeldCompositeStage, VeldStage};

/// Ordered, validated sequence of stages.
#[derive(Clone)]
pub struct VeldPipeline {
    name: String,
    description: String,
    stages: Vec<Arc<dyn VeldStage>>,
}

impl VeldPipeline {
    /// Pipeline name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human-readable description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// The decomposed stage chain, in execution order.
    pub fn stages(&self) -> &[Arc<dyn VeldStage>] {
        &self.stages
    }

    /// Checks structural invariants of the stage chain.
    ///
    /// Verified here, before any worker starts:
    /// - the pipeline contains at least one stage
    /// - stage names are unique
    /// - every stage's resource request is well formed
    /// - each stage's `input_attrs` are a subset of the previous stage's
    ///   `output_attrs`
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(VeldError::pipeline(&self.name, "no stages configured"));
        }

        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.name().to_string()) {
                return Err(VeldError::validation(format!(
                    "duplicate stage name '{}' in pipeline '{}'",
                    stage.name(),
                    self.name
                )));
            }
            stage.resources().validate().map_err(|err| {
                VeldError::validation(format!(
                    "stage '{}' declares invalid resources: {err}",
                    stage.name()
                ))
            })?;
        }

        for pair in self.stages.windows(2) {
            let upstream: HashSet<String> = pair[0].output_attrs().into_iter().collect();
            let missing: Vec<String> = pair[1]
                .input_attrs()
                .into_iter()
                .filter(|attr| !upstream.contains(attr))
                .collect();
            if !missing.is_empty() {
                return Err(VeldError::validation(format!(
                    "stage '{}' requires attributes {:?} not produced by upstream stage '{}'",
                    pair[1].name(),
                    missing,
                    pair[0].name()
                )));
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for VeldPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VeldPipeline")
            .field("name", &self.name)
            .field(
                "stages",
                &self.stages.iter().map(|s| s.name().to_string()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Builder assembling a pipeline from primitive and composite stages.
pub struct VeldPipelineBuilder {
    name: String,
    description: String,
    stages: Vec<Arc<dyn VeldStage>>,
}

impl VeldPipelineBuilder {
    /// Creates an empty builder for the named pipeline.
    pub fn new(name: impl Into<String>) -> Self {
        VeldPipelineBuilder {
            name: name.into(),
            description: String::new(),
            stages: Vec::new(),
        }
    }

    /// Sets the pipeline description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Appends a primitive stage.
    pub fn add_stage(mut self, stage: Arc<dyn VeldStage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Appends a composite stage, expanding it into its primitive stages.
    pub fn add_composite(mut self, composite: &dyn VeldCompositeStage) -> Self {
        log::debug!(
            "decomposing composite stage '{}' at pipeline build time",
            composite.name()
        );
        self.stages.extend(composite.decompose());
        self
    }

    /// Builds and validates the pipeline.
    pub fn build(self) -> Result<VeldPipeline> {
        let pipeline = VeldPipeline {
            name: self.name,
            description: self.description,
            stages: self.stages,
        };
        pipeline.validate()?;
        Ok(pipeline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Result;
    use crate::task::VeldTask;

    #[derive(Debug)]
    struct Decl {
        name: &'static str,
        inputs: Vec<&'static str>,
        outputs: Vec<&'static str>,
    }

    impl VeldStage for Decl {
        fn name(&self) -> &str {
            self.name
        }

        fn input_attrs(&self) -> Vec<String> {
            self.inputs.iter().map(|s| s.to_string()).collect()
        }

        fn output_attrs(&self) -> Vec<String> {
            self.outputs.iter().map(|s| s.to_string()).collect()
        }

        fn process(&self, task: VeldTask) -> Result<Vec<VeldTask>> {
            Ok(vec![task])
        }
    }

    fn decl(name: &'static str, inputs: Vec<&'static str>, outputs: Vec<&'static str>) -> Arc<dyn VeldStage> {
        Arc::new(Decl {
            name,
            inputs,
            outputs,
        })
    }

    #[test]
    fn validates_attribute_chain() {
        let pipeline = VeldPipelineBuilder::new("curate")
            .add_stage(decl("read", vec![], vec!["text", "lang"]))
            .add_stage(decl("filter", vec!["text"], vec!["text", "lang", "score"]))
            .add_stage(decl("write", vec!["text", "score"], vec![]))
            .build();
        assert!(pipeline.is_ok());
    }

    #[test]
    fn rejects_unsatisfied_inputs_before_execution() {
        let err = VeldPipelineBuilder::new("curate")
            .add_stage(decl("read", vec![], vec!["text"]))
            .add_stage(decl("embed", vec!["text", "lang"], vec!["embedding"]))
            .build()
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("embed"), "message was: {message}");
        assert!(message.contains("lang"), "message was: {message}");
    }

    #[test]
    fn rejects_empty_pipeline() {
        assert!(VeldPipelineBuilder::new("empty").build().is_err());
    }

    #[test]
    fn rejects_duplicate_stage_names() {
        let err = VeldPipelineBuilder::new("dup")
            .add_stage(decl("same", vec![], vec![]))
            .add_stage(decl("same", vec![], vec![]))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn composite_decomposes_at_build_time() {
        #[derive(Debug)]
        struct Composite;

        impl VeldCompositeStage for Composite {
            fn name(&self) -> &str {
                "composite.reader"
            }

            fn decompose(&self) -> Vec<Arc<dyn VeldStage>> {
                vec![
                    decl("list", vec![], vec!["path"]),
                    decl("load", vec!["path"], vec!["path", "text"]),
                ]
            }
        }

        let pipeline = VeldPipelineBuilder::new("io")
            .add_composite(&Composite)
            .add_stage(decl("count", vec!["text"], vec![]))
            .build()
            .unwrap();
        let names: Vec<_> = pipeline.stages().iter().map(|s| s.name().to_string()).collect();
        assert_eq!(names, vec!["list", "load", "count"]);
    }
}
