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

//! # Veld Resources Module
//!
//! Declarative per-worker resource requests attached to a stage. A stage asks
//! either for a fractional share of a single accelerator's memory or for
//! whole devices, never both; a fractional request cannot span devices.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, VeldError};

/// Declarative resource request for one worker of a stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VeldResources {
    /// CPU cores requested per worker; fractional values are allowed.
    pub cpu_cores: f64,

    /// Fraction of a single accelerator's memory, in (0, 1].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_memory_fraction: Option<f64>,

    /// Whole accelerator devices granted exclusively.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub whole_gpus: Option<u32>,

    /// Device-count request; mutually exclusive with `gpu_memory_fraction`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_count: Option<f64>,

    /// Hardware video decode units.
    #[serde(default)]
    pub decode_units: u32,

    /// Hardware video encode units.
    #[serde(default)]
    pub encode_units: u32,
}

impl Default for VeldResources {
    fn default() -> Self {
        VeldResources {
            cpu_cores: 1.0,
            gpu_memory_fraction: None,
            whole_gpus: None,
            gpu_count: None,
            decode_units: 0,
            encode_units: 0,
        }
    }
}

impl VeldResources {
    /// A CPU-only request.
    pub fn cpu(cores: f64) -> Self {
        VeldResources {
            cpu_cores: cores,
            ..Default::default()
        }
    }

    /// Requests a fractional share of a single accelerator.
    pub fn with_gpu_fraction(mut self, fraction: f64) -> Self {
        self.gpu_memory_fraction = Some(fraction);
        self
    }

    /// Requests exclusive whole accelerators.
    pub fn with_whole_gpus(mut self, count: u32) -> Self {
        self.whole_gpus = Some(count);
        self
    }

    /// Requests hardware codec units.
    pub fn with_codec_units(mut self, decode: u32, encode: u32) -> Self {
        self.decode_units = decode;
        self.encode_units = encode;
        self
    }

    /// True when the request touches accelerator hardware at all.
    pub fn requires_gpu(&self) -> bool {
        self.gpu_memory_fraction.is_some()
            || self.gpu_count.is_some()
            || self.whole_gpus.map(|n| n > 0).unwrap_or(false)
    }

    /// Validates the request shape.
    ///
    /// A malformed request is a `Validation` error raised at pipeline build
    /// time, never during execution.
    pub fn validate(&self) -> Result<()> {
        if !self.cpu_cores.is_finite() || self.cpu_cores < 0.0 {
            return Err(VeldError::validation(format!(
                "cpu_cores must be a non-negative number, got {}",
                self.cpu_cores
            )));
        }
        if self.gpu_memory_fraction.is_some() && self.gpu_count.is_some() {
            return Err(VeldError::validation(
                "gpu_memory_fraction and gpu_count are mutually exclusive",
            ));
        }
        if let Some(fraction) = self.gpu_memory_fraction {
            if !fraction.is_finite() || fraction <= 0.0 || fraction > 1.0 {
                return Err(VeldError::validation(format!(
                    "gpu_memory_fraction must be in (0, 1], got {fraction}; \
                     a fractional grant cannot span devices"
                )));
            }
        }
        if let Some(count) = self.gpu_count {
            if !count.is_finite() || count <= 0.0 {
                return Err(VeldError::validation(format!(
                    "gpu_count must be positive, got {count}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_one_cpu() {
        let res = VeldResources::default();
        assert_eq!(res.cpu_cores, 1.0);
        assert!(!res.requires_gpu());
        assert!(res.validate().is_ok());
    }

    #[test]
    fn fraction_and_count_are_mutually_exclusive() {
        let res = VeldResources {
            gpu_memory_fraction: Some(0.5),
            gpu_count: Some(2.0),
            ..Default::default()
        };
        assert!(res.validate().is_err());
    }

    #[test]
    fn fraction_must_fit_one_device() {
        let res = VeldResources::cpu(1.0).with_gpu_fraction(1.5);
        assert!(res.validate().is_err());
        let res = VeldResources::cpu(1.0).with_gpu_fraction(1.0);
        assert!(res.validate().is_ok());
        let res = VeldResources::cpu(1.0).with_gpu_fraction(0.0);
        assert!(res.validate().is_err());
    }

    #[test]
    fn negative_cpu_rejected() {
        assert!(VeldResources::cpu(-2.0).validate().is_err());
    }
}
