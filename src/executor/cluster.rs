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

//! # Veld Cluster Module
//!
//! Cluster capacity description and the central resource ledger. The ledger
//! is the single owner of all grant bookkeeping for a pipeline run; every
//! allocation and release goes through it under one lock, so fractional
//! grants on a device can never overlap past 100% of its memory and
//! whole-device grants stay exclusive.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, VeldError};
use crate::resources::VeldResources;

/// Tolerance for floating-point resource arithmetic.
const EPSILON: f64 = 1e-9;

/// Static capacity of the cluster a pipeline runs against.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VeldClusterSpec {
    /// Total CPU cores across the cluster.
    pub cpu_cores: f64,

    /// Number of accelerator devices.
    pub gpus: usize,

    /// Total hardware decode units.
    pub decode_units: u32,

    /// Total hardware encode units.
    pub encode_units: u32,
}

impl VeldClusterSpec {
    /// Detects the capacity of the local machine; accelerators and codec
    /// units must be declared explicitly.
    pub fn detect() -> Self {
        VeldClusterSpec {
            cpu_cores: num_cpus::get() as f64,
            gpus: 0,
            decode_units: 0,
            encode_units: 0,
        }
    }

    /// Declares accelerator devices.
    pub fn with_gpus(mut self, gpus: usize) -> Self {
        self.gpus = gpus;
        self
    }

    /// Declares hardware codec units.
    pub fn with_codec_units(mut self, decode: u32, encode: u32) -> Self {
        self.decode_units = decode;
        self.encode_units = encode;
        self
    }
}

/// A concrete grant handed to one worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VeldAllocation {
    /// Stage the grant belongs to.
    pub stage: String,

    /// CPU cores reserved.
    pub cpu_cores: f64,

    /// Device index backing a fractional grant, if any.
    pub gpu_device: Option<usize>,

    /// Fraction of `gpu_device`'s memory reserved.
    pub gpu_fraction: Option<f64>,

    /// Devices reserved exclusively.
    pub whole_devices: Vec<usize>,

    /// Decode units reserved.
    pub decode_units: u32,

    /// Encode units reserved.
    pub encode_units: u32,
}

/// Central grant bookkeeping for one pipeline run.
///
/// The executor holds the ledger behind a mutex; workers never touch it
/// directly. `cpu_cap` reflects the configured `cpu_allocation_percentage`
/// so the scheduler itself and other pipelines keep headroom.
#[derive(Debug)]
pub struct VeldResourceLedger {
    spec: VeldClusterSpec,
    cpu_cap: f64,
    cpu_in_use: f64,
    device_fraction_in_use: Vec<f64>,
    device_exclusive: Vec<bool>,
    decode_in_use: u32,
    encode_in_use: u32,
}

impl VeldResourceLedger {
    /// Creates a ledger capping CPU allocation at the given percentage of
    /// the cluster total.
    pub fn new(spec: VeldClusterSpec, cpu_allocation_percentage: f64) -> Self {
        let cpu_cap = spec.cpu_cores * cpu_allocation_percentage.clamp(0.0, 1.0);
        let gpus = spec.gpus;
        VeldResourceLedger {
            spec,
            cpu_cap,
            cpu_in_use: 0.0,
            device_fraction_in_use: vec![0.0; gpus],
            device_exclusive: vec![false; gpus],
            decode_in_use: 0,
            encode_in_use: 0,
        }
    }

    /// Fails with `ResourceExhaustion` when the request could never be
    /// satisfied by this cluster, even with every other grant released.
    pub fn check_feasible(&self, stage: &str, request: &VeldResources) -> Result<()> {
        if request.cpu_cores > self.cpu_cap + EPSILON {
            return Err(VeldError::resources(
                stage,
                format!(
                    "requests {} CPU cores but the allocation cap is {:.2}",
                    request.cpu_cores, self.cpu_cap
                ),
            ));
        }
        let (fraction, whole) = Self::gpu_shape(request);
        if (fraction.is_some() || whole > 0) && self.spec.gpus == 0 {
            return Err(VeldError::resources(
                stage,
                "requests accelerator resources but the cluster has no devices",
            ));
        }
        if whole > self.spec.gpus {
            return Err(VeldError::resources(
                stage,
                format!(
                    "requests {} whole devices but the cluster has {}",
                    whole, self.spec.gpus
                ),
            ));
        }
        if request.decode_units > self.spec.decode_units {
            return Err(VeldError::resources(
                stage,
                format!(
                    "requests {} decode units but the cluster has {}",
                    request.decode_units, self.spec.decode_units
                ),
            ));
        }
        if request.encode_units > self.spec.encode_units {
            return Err(VeldError::resources(
                stage,
                format!(
                    "requests {} encode units but the cluster has {}",
                    request.encode_units, self.spec.encode_units
                ),
            ));
        }
        Ok(())
    }

    /// Attempts to grant the request right now.
    ///
    /// Returns `Ok(None)` when the request is feasible but there is no
    /// headroom at this instant; the caller retries on a later tick.
    pub fn try_allocate(
        &mut self,
        stage: &str,
        request: &VeldResources,
    ) -> Result<Option<VeldAllocation>> {
        self.check_feasible(stage, request)?;

        if self.cpu_in_use + request.cpu_cores > self.cpu_cap + EPSILON {
            return Ok(None);
        }
        if self.decode_in_use + request.decode_units > self.spec.decode_units
            || self.encode_in_use + request.encode_units > self.spec.encode_units
        {
            return Ok(None);
        }

        let (fraction, whole) = Self::gpu_shape(request);

        // A fractional grant must land on a single device.
        let mut gpu_device = None;
        if let Some(fraction) = fraction {
            match self.find_fractional_device(fraction) {
                Some(device) => gpu_device = Some(device),
                None => return Ok(None),
            }
        }

        let mut whole_devices = Vec::new();
        if whole > 0 {
            match self.find_whole_devices(whole) {
                Some(devices) => whole_devices = devices,
                None => return Ok(None),
            }
        }

        self.cpu_in_use += request.cpu_cores;
        self.decode_in_use += request.decode_units;
        self.encode_in_use += request.encode_units;
        if let (Some(device), Some(fraction)) = (gpu_device, fraction) {
            self.device_fraction_in_use[device] += fraction;
        }
        for &device in &whole_devices {
            self.device_exclusive[device] = true;
        }

        Ok(Some(VeldAllocation {
            stage: stage.to_string(),
            cpu_cores: request.cpu_cores,
            gpu_device,
            gpu_fraction: fraction,
            whole_devices,
            decode_units: request.decode_units,
            encode_units: request.encode_units,
        }))
    }

    /// Returns a grant to the pool.
    pub fn release(&mut self, allocation: &VeldAllocation) {
        self.cpu_in_use = (self.cpu_in_use - allocation.cpu_cores).max(0.0);
        self.decode_in_use = self.decode_in_use.saturating_sub(allocation.decode_units);
        self.encode_in_use = self.encode_in_use.saturating_sub(allocation.encode_units);
        if let (Some(device), Some(fraction)) = (allocation.gpu_device, allocation.gpu_fraction) {
            let in_use = &mut self.device_fraction_in_use[device];
            *in_use = (*in_use - fraction).max(0.0);
        }
        for &device in &allocation.whole_devices {
            self.device_exclusive[device] = false;
        }
    }

    /// CPU cores still grantable under the cap.
    pub fn cpu_headroom(&self) -> f64 {
        (self.cpu_cap - self.cpu_in_use).max(0.0)
    }

    /// Normalizes a request into (single-device fraction, whole-device count).
    ///
    /// A `gpu_count` below one is a fractional share of a single device; at
    /// one or above it rounds up to exclusive whole devices, as does
    /// `whole_gpus`.
    fn gpu_shape(request: &VeldResources) -> (Option<f64>, usize) {
        let mut fraction = request.gpu_memory_fraction;
        let mut whole = request.whole_gpus.unwrap_or(0) as usize;
        if let Some(count) = request.gpu_count {
            if count < 1.0 {
                fraction = Some(count);
            } else {
                whole += count.ceil() as usize;
            }
        }
        (fraction, whole)
    }

    fn find_fractional_device(&self, fraction: f64) -> Option<usize> {
        (0..self.spec.gpus).find(|&device| {
            !self.device_exclusive[device]
                && self.device_fraction_in_use[device] + fraction <= 1.0 + EPSILON
        })
    }

    fn find_whole_devices(&self, count: usize) -> Option<Vec<usize>> {
        let free: Vec<usize> = (0..self.spec.gpus)
            .filter(|&device| {
                !self.device_exclusive[device]
                    && self.device_fraction_in_use[device] <= EPSILON
            })
            .take(count)
            .collect();
        if free.len() == count {
            Some(free)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> VeldClusterSpec {
        VeldClusterSpec {
            cpu_cores: 8.0,
            gpus: 2,
            decode_units: 2,
            encode_units: 0,
        }
    }

    #[test]
    fn fractional_grants_share_one_device_up_to_full() {
        let mut ledger = VeldResourceLedger::new(spec(), 1.0);
        let request = VeldResources::cpu(1.0).with_gpu_fraction(0.4);

        let a = ledger.try_allocate("s", &request).unwrap().unwrap();
        let b = ledger.try_allocate("s", &request).unwrap().unwrap();
        assert_eq!(a.gpu_device, Some(0));
        assert_eq!(b.gpu_device, Some(0));

        // 0.4 + 0.4 + 0.4 exceeds device 0; third grant spills to device 1.
        let c = ledger.try_allocate("s", &request).unwrap().unwrap();
        assert_eq!(c.gpu_device, Some(1));

        ledger.release(&a);
        let d = ledger.try_allocate("s", &request).unwrap().unwrap();
        assert_eq!(d.gpu_device, Some(0));
    }

    #[test]
    fn whole_device_grants_are_exclusive() {
        let mut ledger = VeldResourceLedger::new(spec(), 1.0);
        let whole = VeldResources::cpu(1.0).with_whole_gpus(1);
        let fractional = VeldResources::cpu(1.0).with_gpu_fraction(0.1);

        let a = ledger.try_allocate("s", &whole).unwrap().unwrap();
        assert_eq!(a.whole_devices, vec![0]);

        let b = ledger.try_allocate("s", &fractional).unwrap().unwrap();
        assert_eq!(b.gpu_device, Some(1));

        // Device 1 now carries a fraction; a second whole-device grant must wait.
        assert!(ledger.try_allocate("s", &whole).unwrap().is_none());
        ledger.release(&b);
        assert!(ledger.try_allocate("s", &whole).unwrap().is_some());
    }

    #[test]
    fn infeasible_requests_fail_fast() {
        let ledger = VeldResourceLedger::new(spec(), 1.0);
        let err = ledger
            .check_feasible("s", &VeldResources::cpu(1.0).with_whole_gpus(3))
            .unwrap_err();
        assert!(matches!(err, VeldError::ResourceExhaustion { .. }));

        let err = ledger
            .check_feasible("s", &VeldResources::cpu(64.0))
            .unwrap_err();
        assert!(matches!(err, VeldError::ResourceExhaustion { .. }));
    }

    #[test]
    fn cpu_cap_limits_concurrent_grants() {
        let mut ledger = VeldResourceLedger::new(spec(), 0.5); // cap = 4 cores
        let request = VeldResources::cpu(2.0);
        assert!(ledger.try_allocate("s", &request).unwrap().is_some());
        assert!(ledger.try_allocate("s", &request).unwrap().is_some());
        assert!(ledger.try_allocate("s", &request).unwrap().is_none());
        assert!(ledger.cpu_headroom() < EPSILON);
    }

    #[test]
    fn sub_unit_gpu_count_is_fractional() {
        let mut ledger = VeldResourceLedger::new(spec(), 1.0);
        let request = VeldResources {
            gpu_count: Some(0.5),
            ..VeldResources::cpu(1.0)
        };
        let grant = ledger.try_allocate("s", &request).unwrap().unwrap();
        assert_eq!(grant.gpu_fraction, Some(0.5));
        assert_eq!(grant.gpu_device, Some(0));
        assert!(grant.whole_devices.is_empty());
    }
}
