use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use k8s_openapi::api::core::v1::Pod;
use kube::core::admission::{
    AdmissionRequest, AdmissionResponse, AdmissionReview, SerializePatchError,
};
use kube::core::{DynamicObject, GroupVersionResource, TypeMeta};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::engine::AffinityEngine;
use crate::metrics::AdmissionMetrics;

const JSON_MEDIA_TYPE: &str = "application/json";
const REVIEW_KIND: &str = "AdmissionReview";
const FALLBACK_REVIEW_VERSION: &str = "admission.k8s.io/v1beta1";

pub struct AppState {
    pub engine: AffinityEngine,
    pub metrics: AdmissionMetrics,
    /// Answer requests with a non-JSON content type with an error review
    /// instead of an empty body.
    pub reject_unsupported_content_type: bool,
}

pub type SharedState = Arc<AppState>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookType {
    Admit,
    Mutate,
}

impl WebhookType {
    pub fn as_str(self) -> &'static str {
        match self {
            WebhookType::Admit => "admit",
            WebhookType::Mutate => "mutate",
        }
    }
}

/// Failures that turn into an error response instead of a verdict.
#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("contentType={0:?}, expect application/json")]
    UnsupportedContentType(String),
    #[error("failed to decode AdmissionReview: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("AdmissionReview has no request")]
    MissingRequest,
    #[error("expect resource to be /v1, Resource=pods, got {0}")]
    UnexpectedResource(String),
    #[error("admission request has no object")]
    MissingObject,
    #[error("failed to decode pod: {0}")]
    InvalidPod(#[source] serde_json::Error),
    #[error(transparent)]
    Patch(#[from] SerializePatchError),
}

impl ReviewError {
    pub fn reason(&self) -> &'static str {
        match self {
            ReviewError::UnsupportedContentType(_) => "content_type",
            ReviewError::Decode(_) => "decode",
            ReviewError::MissingRequest => "missing_request",
            ReviewError::UnexpectedResource(_) => "unexpected_resource",
            ReviewError::MissingObject => "missing_object",
            ReviewError::InvalidPod(_) => "invalid_pod",
            ReviewError::Patch(_) => "patch",
        }
    }
}

/// What is known about the inbound review when building an error response.
#[derive(Debug, Default)]
struct Envelope {
    uid: String,
    types: Option<TypeMeta>,
}

impl Envelope {
    fn from_request(req: &AdmissionRequest<DynamicObject>) -> Self {
        Self {
            uid: req.uid.clone(),
            types: Some(req.types.clone()),
        }
    }

    /// Best effort recovery of uid and apiVersion from a body that did not
    /// decode as an AdmissionReview.
    fn salvage(body: &[u8]) -> Self {
        let Ok(raw) = serde_json::from_slice::<Value>(body) else {
            return Self::default();
        };
        let uid = raw
            .pointer("/request/uid")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let types = raw
            .get("apiVersion")
            .and_then(Value::as_str)
            .map(|api_version| TypeMeta {
                api_version: api_version.to_string(),
                kind: REVIEW_KIND.to_string(),
            });
        Self { uid, types }
    }
}

pub async fn handle_admit(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_webhook(&state, &headers, &body, WebhookType::Admit)
}

pub async fn handle_mutate(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_webhook(&state, &headers, &body, WebhookType::Mutate)
}

fn handle_webhook(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
    webhook: WebhookType,
) -> Response {
    let start = Instant::now();
    let wh = webhook.as_str();
    state.metrics.record_request(wh);

    let response = match check_content_type(headers) {
        Ok(()) => Json(state.review(body, webhook)).into_response(),
        Err(err) => {
            error!(webhook = wh, "{err}");
            if state.reject_unsupported_content_type {
                Json(state.reject(webhook, err, Envelope::salvage(body))).into_response()
            } else {
                state.metrics.record_error(wh, err.reason());
                StatusCode::OK.into_response()
            }
        }
    };

    state
        .metrics
        .observe_duration(wh, start.elapsed().as_secs_f64());
    response
}

fn check_content_type(headers: &HeaderMap) -> Result<(), ReviewError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let media_type = content_type.split(';').next().unwrap_or_default().trim();

    if media_type.eq_ignore_ascii_case(JSON_MEDIA_TYPE) {
        Ok(())
    } else {
        Err(ReviewError::UnsupportedContentType(content_type.to_string()))
    }
}

impl AppState {
    /// Decodes one AdmissionReview body and produces the response review.
    /// Every failure is folded into the response; the uid of the request is
    /// carried over whenever it can be read.
    pub fn review(&self, body: &[u8], webhook: WebhookType) -> AdmissionReview<DynamicObject> {
        let wh = webhook.as_str();

        let review: AdmissionReview<DynamicObject> = match serde_json::from_slice(body) {
            Ok(review) => review,
            Err(e) => {
                return self.reject(webhook, ReviewError::Decode(e), Envelope::salvage(body));
            }
        };

        let mut req: AdmissionRequest<DynamicObject> = match review.try_into() {
            Ok(req) => req,
            Err(_) => {
                return self.reject(webhook, ReviewError::MissingRequest, Envelope::salvage(body));
            }
        };

        let response = match self.decide(&req, webhook) {
            Ok(response) => response,
            Err(err) => {
                return self.reject(webhook, err, Envelope::from_request(&req));
            }
        };

        // The embedded objects are not needed past the decision.
        req.object = None;
        req.old_object = None;
        debug!(
            webhook = wh,
            uid = %req.uid,
            request = ?req,
            allowed = response.allowed,
            patched = response.patch.is_some(),
            "sending response"
        );

        self.metrics.record_response(wh, response.allowed);
        response.into_review()
    }

    fn decide(
        &self,
        req: &AdmissionRequest<DynamicObject>,
        webhook: WebhookType,
    ) -> Result<AdmissionResponse, ReviewError> {
        check_resource(&req.resource)?;
        let pod = parse_pod(req.object.as_ref())?;
        let mut response = AdmissionResponse::from(req);

        match webhook {
            WebhookType::Admit => {
                let verdict = self.engine.evaluate(&pod);
                debug!(uid = %req.uid, ?verdict, "validated pod");
                response.allowed = verdict.is_allowed();
                Ok(response)
            }
            WebhookType::Mutate => {
                let mutation = self.engine.evaluate_and_patch(&pod);
                debug!(uid = %req.uid, outcome = mutation.outcome.as_str(), "mutated pod");
                self.metrics.record_patch_decision(mutation.outcome);
                response.allowed = mutation.allowed;
                match mutation.patch {
                    Some(patch) => Ok(response.with_patch(patch)?),
                    None => Ok(response),
                }
            }
        }
    }

    /// Error response: fail closed, with the error text as the result message.
    fn reject(
        &self,
        webhook: WebhookType,
        err: ReviewError,
        envelope: Envelope,
    ) -> AdmissionReview<DynamicObject> {
        let wh = webhook.as_str();
        warn!(webhook = wh, uid = %envelope.uid, reason = err.reason(), "{err}");
        self.metrics.record_error(wh, err.reason());

        let mut response = AdmissionResponse::invalid(&err);
        response.uid = envelope.uid;
        response.types = envelope
            .types
            .filter(|t| !t.api_version.is_empty())
            .unwrap_or_else(|| TypeMeta {
                api_version: FALLBACK_REVIEW_VERSION.to_string(),
                kind: REVIEW_KIND.to_string(),
            });

        self.metrics.record_response(wh, response.allowed);
        response.into_review()
    }
}

fn check_resource(resource: &GroupVersionResource) -> Result<(), ReviewError> {
    if resource.group.is_empty() && resource.version == "v1" && resource.resource == "pods" {
        Ok(())
    } else {
        Err(ReviewError::UnexpectedResource(format!(
            "{}/{}, Resource={}",
            resource.group, resource.version, resource.resource
        )))
    }
}

fn parse_pod(object: Option<&DynamicObject>) -> Result<Pod, ReviewError> {
    let object = object.ok_or(ReviewError::MissingObject)?;
    serde_json::to_value(object)
        .and_then(serde_json::from_value::<Pod>)
        .map_err(ReviewError::InvalidPod)
}
