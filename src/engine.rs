use std::collections::BTreeMap;

use json_patch::Patch;
use k8s_openapi::api::core::v1::Pod;
use serde_json::Value;
use tracing::debug;

use crate::config::{ConfigError, PolicyMode, PolicySettings};
use crate::patch::build_affinity_patch;
use crate::selector::PodSelector;

static NO_LABELS: BTreeMap<String, String> = BTreeMap::new();

/// Process-wide policy, fixed at startup.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub mode: PolicyMode,
    pub affinity_patch: Value,
    /// `None` selects every pod.
    pub pod_selector: Option<PodSelector>,
}

impl PolicyConfig {
    pub fn from_settings(settings: &PolicySettings) -> Result<Self, ConfigError> {
        let affinity_patch = settings.affinity_value()?;
        let pod_selector = settings
            .pod_selector_json()
            .map(|raw| PodSelector::parse(&raw))
            .transpose()?;

        Ok(Self {
            mode: settings.mode,
            affinity_patch,
            pod_selector,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Denied,
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed)
    }
}

/// Why the mutating path did or did not produce a patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatchOutcome {
    Patched,
    ModeDoesNotPatch,
    AffinityPresent,
    SelectorMismatch,
}

impl PatchOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            PatchOutcome::Patched => "patched",
            PatchOutcome::ModeDoesNotPatch => "mode_does_not_patch",
            PatchOutcome::AffinityPresent => "affinity_present",
            PatchOutcome::SelectorMismatch => "selector_mismatch",
        }
    }
}

pub struct Mutation {
    pub allowed: bool,
    pub patch: Option<Patch>,
    pub outcome: PatchOutcome,
}

pub struct AffinityEngine {
    config: PolicyConfig,
    patch: Patch,
}

impl AffinityEngine {
    pub fn new(config: PolicyConfig) -> Self {
        let patch = build_affinity_patch(&config.affinity_patch);
        Self { config, patch }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn patch(&self) -> &Patch {
        &self.patch
    }

    /// Validating path. Only `denyMissing` can reject, and only pods without
    /// an affinity.
    pub fn evaluate(&self, pod: &Pod) -> Verdict {
        match self.config.mode {
            PolicyMode::DenyMissing if !has_affinity(pod) => Verdict::Denied,
            PolicyMode::DenyMissing | PolicyMode::PatchAlways | PolicyMode::PatchMissing => {
                Verdict::Allowed
            }
        }
    }

    /// Mutating path. Always allows; the checks run mode first, then affinity
    /// presence, then the pod selector.
    pub fn evaluate_and_patch(&self, pod: &Pod) -> Mutation {
        let outcome = self.patch_outcome(pod);
        let patch = match outcome {
            PatchOutcome::Patched => Some(self.patch.clone()),
            _ => None,
        };
        Mutation {
            allowed: true,
            patch,
            outcome,
        }
    }

    fn patch_outcome(&self, pod: &Pod) -> PatchOutcome {
        match self.config.mode {
            PolicyMode::DenyMissing => {
                debug!(mode = %self.config.mode, "mode does not patch");
                return PatchOutcome::ModeDoesNotPatch;
            }
            PolicyMode::PatchMissing if has_affinity(pod) => {
                debug!("affinity found, not patching");
                return PatchOutcome::AffinityPresent;
            }
            PolicyMode::PatchMissing | PolicyMode::PatchAlways => {}
        }

        let labels = pod.metadata.labels.as_ref().unwrap_or(&NO_LABELS);
        if let Some(selector) = &self.config.pod_selector {
            if !selector.matches(labels) {
                debug!(?labels, %selector, "pod labels did not match selector");
                return PatchOutcome::SelectorMismatch;
            }
        }

        debug!("patching pod");
        PatchOutcome::Patched
    }
}

pub fn has_affinity(pod: &Pod) -> bool {
    pod.spec.as_ref().is_some_and(|spec| spec.affinity.is_some())
}
