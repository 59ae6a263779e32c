use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::config::PolicyMode;
use crate::engine::PatchOutcome;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WebhookLabels {
    pub webhook: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResponseLabels {
    pub webhook: &'static str,
    pub allowed: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub webhook: &'static str,
    pub reason: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PatchLabels {
    pub outcome: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ModeLabels {
    pub mode: &'static str,
}

pub struct AdmissionMetrics {
    pub requests_total: Family<WebhookLabels, Counter>,
    pub responses_total: Family<ResponseLabels, Counter>,
    pub errors_total: Family<ErrorLabels, Counter>,
    pub patch_decisions_total: Family<PatchLabels, Counter>,
    pub request_duration_seconds: Family<WebhookLabels, Histogram>,
}

const DURATION_BUCKETS: [f64; 12] = [
    0.0001, 0.00025, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 1.0,
];

fn new_duration_histogram() -> Histogram {
    Histogram::new(DURATION_BUCKETS.iter().copied())
}

impl AdmissionMetrics {
    pub fn new(registry: &mut Registry, mode: PolicyMode) -> Self {
        let registry = registry.sub_registry_with_prefix("affinity_admission");

        let requests_total = Family::<WebhookLabels, Counter>::default();
        registry.register(
            "requests",
            "Total number of admission requests received",
            requests_total.clone(),
        );

        let responses_total = Family::<ResponseLabels, Counter>::default();
        registry.register(
            "responses",
            "Total number of admission responses sent",
            responses_total.clone(),
        );

        let errors_total = Family::<ErrorLabels, Counter>::default();
        registry.register(
            "errors",
            "Admission requests answered with an error response or dropped",
            errors_total.clone(),
        );

        let patch_decisions_total = Family::<PatchLabels, Counter>::default();
        registry.register(
            "patch_decisions",
            "Mutating decisions by outcome",
            patch_decisions_total.clone(),
        );

        let request_duration_seconds =
            Family::<WebhookLabels, Histogram>::new_with_constructor(new_duration_histogram);
        registry.register(
            "request_duration_seconds",
            "Duration of admission request processing in seconds",
            request_duration_seconds.clone(),
        );

        let policy_mode = Family::<ModeLabels, Gauge>::default();
        registry.register(
            "policy_mode",
            "Active policy mode (1) among the known modes",
            policy_mode.clone(),
        );
        for known in PolicyMode::ALL {
            policy_mode
                .get_or_create(&ModeLabels {
                    mode: known.as_str(),
                })
                .set(if known == mode { 1 } else { 0 });
        }

        Self {
            requests_total,
            responses_total,
            errors_total,
            patch_decisions_total,
            request_duration_seconds,
        }
    }

    pub fn record_request(&self, webhook: &'static str) {
        self.requests_total
            .get_or_create(&WebhookLabels { webhook })
            .inc();
    }

    pub fn record_response(&self, webhook: &'static str, allowed: bool) {
        self.responses_total
            .get_or_create(&ResponseLabels {
                webhook,
                allowed: if allowed { "true" } else { "false" },
            })
            .inc();
    }

    pub fn record_error(&self, webhook: &'static str, reason: &'static str) {
        self.errors_total
            .get_or_create(&ErrorLabels { webhook, reason })
            .inc();
    }

    pub fn record_patch_decision(&self, outcome: PatchOutcome) {
        self.patch_decisions_total
            .get_or_create(&PatchLabels {
                outcome: outcome.as_str(),
            })
            .inc();
    }

    pub fn observe_duration(&self, webhook: &'static str, seconds: f64) {
        self.request_duration_seconds
            .get_or_create(&WebhookLabels { webhook })
            .observe(seconds);
    }
}
