use crate::config::ChoiceConfig;
use crate::database::get_db;
use chrono::Utc;
use futures::stream::StreamExt;
use mongodb::{
    bson::{doc, oid::ObjectId, DateTime, Document},
    options::FindOptions,
    Collection, Database,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::incident_document::{IncidentDocumentResponse, IncidentDocumentStub};
use super::incident_update::IncidentUpdateResponse;

const ORDERING_FIELDS: [&str; 5] = ["created_at", "started_at", "detected_at", "level", "scope"];

#[derive(Debug, Deserialize, Serialize)]
pub struct Incident {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,
    pub title: String,
    pub description: String,
    pub level: String,
    pub scope: String,
    pub safety_compliance: String,
    pub security_privacy: String,
    pub data_quality: String,
    pub psd2_impact: String,
    pub started_at: DateTime,
    pub detected_at: DateTime,
    pub time_format: String,
    pub detection_source: String,
    pub incident_type: String,
    pub impacted_locations: Vec<String>,
    pub impacted_parties: Vec<String>,
    pub incident_commander: String,
    pub reporting_org: String,
    pub estimated_time_to_mitigation: String,
    pub first_detected_in: String,
    pub impacted_assets: Vec<String>,
    pub impacted_areas: Vec<String>,
    pub additional_subscribers: String,
    pub safety_compliance_document_url: String,
    pub l5_confirmation: bool,
    pub mitigation_policy_acknowledgment: bool,
    pub send_email_notifications: bool,
    pub status: String,
    pub created_at: DateTime,
    pub updated_at: DateTime,
    pub created_by: Option<String>,
}

/// Create payload, in the front end's camelCase naming. The serde renames are
/// the complete alias table; `incidentDetectedAt` and `scImpactDocumentUrl`
/// are the two historical irregulars of that contract.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentRequest {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub safety_compliance: String,
    #[serde(default)]
    pub security_privacy: String,
    #[serde(default)]
    pub data_quality: String,
    #[serde(default)]
    pub psd2_impact: String,
    pub started_at: Option<chrono::DateTime<Utc>>,
    #[serde(rename = "incidentDetectedAt")]
    pub detected_at: Option<chrono::DateTime<Utc>>,
    #[serde(default = "default_time_format")]
    pub time_format: String,
    #[serde(default = "default_detection_source")]
    pub detection_source: String,
    #[serde(default = "default_incident_type")]
    pub incident_type: String,
    #[serde(default)]
    pub impacted_locations: Vec<String>,
    #[serde(default)]
    pub impacted_parties: Vec<String>,
    #[serde(default)]
    pub incident_commander: String,
    #[serde(default)]
    pub reporting_org: String,
    #[serde(default = "default_estimated_time_to_mitigation")]
    pub estimated_time_to_mitigation: String,
    #[serde(default)]
    pub first_detected_in: String,
    #[serde(default)]
    pub impacted_assets: Vec<String>,
    #[serde(default)]
    pub impacted_areas: Vec<String>,
    #[serde(default)]
    pub additional_subscribers: String,
    #[serde(default, rename = "scImpactDocumentUrl")]
    pub safety_compliance_document_url: String,
    #[serde(default)]
    pub l5_confirmation: bool,
    #[serde(default)]
    pub mitigation_policy_acknowledgment: bool,
    #[serde(default = "default_send_email_notifications")]
    pub send_email_notifications: bool,
    #[serde(default)]
    pub related_documents: Vec<IncidentDocumentStub>,
}

/// Partial update payload, in the stored snake_case naming. Only supplied
/// fields are validated and written.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct IncidentPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub level: Option<String>,
    pub scope: Option<String>,
    pub safety_compliance: Option<String>,
    pub security_privacy: Option<String>,
    pub data_quality: Option<String>,
    pub psd2_impact: Option<String>,
    pub started_at: Option<chrono::DateTime<Utc>>,
    pub detected_at: Option<chrono::DateTime<Utc>>,
    pub time_format: Option<String>,
    pub detection_source: Option<String>,
    pub incident_type: Option<String>,
    pub impacted_locations: Option<Vec<String>>,
    pub impacted_parties: Option<Vec<String>>,
    pub incident_commander: Option<String>,
    pub reporting_org: Option<String>,
    pub estimated_time_to_mitigation: Option<String>,
    pub first_detected_in: Option<String>,
    pub impacted_assets: Option<Vec<String>>,
    pub impacted_areas: Option<Vec<String>>,
    pub additional_subscribers: Option<String>,
    pub safety_compliance_document_url: Option<String>,
    pub l5_confirmation: Option<bool>,
    pub mitigation_policy_acknowledgment: Option<bool>,
    pub send_email_notifications: Option<bool>,
    pub status: Option<String>,
    pub related_documents: Option<Vec<IncidentDocumentStub>>,
}

#[derive(Debug, Default)]
pub struct IncidentQuery {
    pub level: Vec<String>,
    pub scope: Vec<String>,
    pub status: Vec<String>,
    pub incident_type: Vec<String>,
    pub detection_source: Vec<String>,
    pub reporting_org: Vec<String>,
    pub incident_commander: Vec<String>,
    pub impacted_assets: Vec<String>,
    pub impacted_areas: Vec<String>,
    pub impacted_locations: Option<String>,
    pub impacted_parties: Option<String>,
    pub search: Option<String>,
    pub ordering: Option<String>,
    pub page: Option<u64>,
    pub page_size: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct IncidentSummaryResponse {
    pub _id: String,
    pub title: String,
    pub description: String,
    pub level: String,
    pub scope: String,
    pub incident_type: String,
    pub status: String,
    pub incident_commander: String,
    pub started_at: chrono::DateTime<Utc>,
    pub created_at: chrono::DateTime<Utc>,
    pub updated_at: chrono::DateTime<Utc>,
    pub impacted_locations_display: String,
    pub impacted_parties_display: String,
    pub is_l5_high: bool,
}

#[derive(Debug, Serialize)]
pub struct IncidentResponse {
    pub _id: String,
    pub title: String,
    pub description: String,
    pub level: String,
    pub scope: String,
    pub safety_compliance: String,
    pub security_privacy: String,
    pub data_quality: String,
    pub psd2_impact: String,
    pub started_at: chrono::DateTime<Utc>,
    pub detected_at: chrono::DateTime<Utc>,
    pub time_format: String,
    pub detection_source: String,
    pub incident_type: String,
    pub impacted_locations: Vec<String>,
    pub impacted_parties: Vec<String>,
    pub incident_commander: String,
    pub reporting_org: String,
    pub estimated_time_to_mitigation: String,
    pub first_detected_in: String,
    pub impacted_assets: Vec<String>,
    pub impacted_areas: Vec<String>,
    pub additional_subscribers: String,
    pub safety_compliance_document_url: String,
    pub l5_confirmation: bool,
    pub mitigation_policy_acknowledgment: bool,
    pub send_email_notifications: bool,
    pub status: String,
    pub created_at: chrono::DateTime<Utc>,
    pub updated_at: chrono::DateTime<Utc>,
    pub created_by: Option<String>,
    pub documents: Vec<IncidentDocumentResponse>,
    pub updates: Vec<IncidentUpdateResponse>,
    pub is_l5_high: bool,
    pub requires_mitigation_policy: bool,
    pub impacted_locations_display: String,
    pub impacted_parties_display: String,
}

#[derive(Debug, Serialize)]
pub struct IncidentListResponse {
    pub count: u64,
    pub page: u64,
    pub page_size: u64,
    pub results: Vec<IncidentSummaryResponse>,
}

#[derive(Debug, Serialize)]
pub struct IncidentTimeline {
    pub started_at: chrono::DateTime<Utc>,
    pub detected_at: chrono::DateTime<Utc>,
    pub created_at: chrono::DateTime<Utc>,
    pub updated_at: chrono::DateTime<Utc>,
    pub time_to_detection: Option<f64>,
    pub time_since_started: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct IncidentStatistics {
    pub total_incidents: u64,
    pub by_level: LevelBreakdown,
    pub by_scope: ScopeBreakdown,
    pub by_status: StatusBreakdown,
    pub l5_high_incidents: u64,
    pub critical_incidents: u64,
}

#[derive(Debug, Serialize)]
pub struct LevelBreakdown {
    #[serde(rename = "L2")]
    pub l2: u64,
    #[serde(rename = "L3")]
    pub l3: u64,
    #[serde(rename = "L4")]
    pub l4: u64,
    #[serde(rename = "L5")]
    pub l5: u64,
}

#[derive(Debug, Serialize)]
pub struct ScopeBreakdown {
    #[serde(rename = "Low")]
    pub low: u64,
    #[serde(rename = "Medium")]
    pub medium: u64,
    #[serde(rename = "High")]
    pub high: u64,
}

#[derive(Debug, Serialize)]
pub struct StatusBreakdown {
    pub reported: u64,
    pub mitigating: u64,
    pub resolved: u64,
    pub postmortem: u64,
    pub closed: u64,
}

/// Field-scoped validation failures, serialized as `{field: [message, ...]}`.
#[derive(Debug, Default, Serialize)]
pub struct ValidationErrors(BTreeMap<String, Vec<String>>);

impl ValidationErrors {
    pub fn add(&mut self, field: &str, message: &str) {
        self.0
            .entry(field.to_string())
            .or_default()
            .push(message.to_string());
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

fn default_time_format() -> String {
    "Local Time".to_string()
}
fn default_detection_source() -> String {
    "Manual".to_string()
}
fn default_incident_type() -> String {
    "Planned".to_string()
}
fn default_estimated_time_to_mitigation() -> String {
    "unknown".to_string()
}
fn default_send_email_notifications() -> bool {
    true
}

fn email_regex() -> Regex {
    Regex::new(
        r"^([a-z0-9_+]([a-z0-9_+.]*[a-z0-9_+])?)@([a-z0-9]+([\-\.]{1}[a-z0-9]+)*\.[a-z]{2,6})",
    )
    .unwrap()
}

fn validate_choice(
    errors: &mut ValidationErrors,
    config: &ChoiceConfig,
    config_field: &str,
    field: &str,
    value: &str,
) {
    if !value.is_empty() && !config.is_valid_value(config_field, value) {
        errors.add(field, &format!("\"{value}\" is not a valid choice."));
    }
}

pub(crate) fn validate_email(errors: &mut ValidationErrors, field: &str, value: &str) {
    if !value.is_empty() && !email_regex().is_match(value) {
        errors.add(field, "Enter a valid email address.");
    }
}

fn insert_any_of(filter: &mut Document, field: &str, values: &[String]) {
    if !values.is_empty() {
        filter.insert(field, doc! { "$in": values.to_vec() });
    }
}

// Comma-separated candidates; the stored array matches when it contains any.
fn insert_contains_any(filter: &mut Document, field: &str, candidates: &str) {
    let candidates: Vec<String> = candidates
        .split(',')
        .map(|candidate| candidate.trim().to_string())
        .filter(|candidate| !candidate.is_empty())
        .collect();
    if !candidates.is_empty() {
        filter.insert(field, doc! { "$in": candidates });
    }
}

pub fn and_filter(base: &Document, extra: Document) -> Document {
    if base.is_empty() {
        extra
    } else if extra.is_empty() {
        base.clone()
    } else {
        doc! { "$and": [base.clone(), extra] }
    }
}

pub fn critical_filter() -> Document {
    doc! { "level": "L5", "scope": { "$in": ["Medium", "High"] } }
}

impl IncidentRequest {
    pub fn validate(&self, config: &ChoiceConfig) -> Result<(), ValidationErrors> {
        let mut errors: ValidationErrors = ValidationErrors::default();

        if self.started_at.is_none() {
            errors.add("started_at", "Started at time is required.");
        }
        if self.detected_at.is_none() {
            errors.add("detected_at", "Detected at time is required.");
        }
        if let (Some(started_at), Some(detected_at)) = (self.started_at, self.detected_at) {
            if detected_at < started_at {
                errors.add(
                    "detected_at",
                    "Detected at time cannot be before started at time.",
                );
            }
        }

        if self.level == "L5" {
            if !self.l5_confirmation {
                errors.add(
                    "l5_confirmation",
                    "L5 incident confirmation is required for L5 incidents.",
                );
            }
            if (self.scope == "Medium" || self.scope == "High")
                && !self.mitigation_policy_acknowledgment
            {
                errors.add(
                    "mitigation_policy_acknowledgment",
                    "Mitigation policy acknowledgment is required for L5 Medium/High incidents.",
                );
            }
        }

        validate_choice(&mut errors, config, "levels", "level", &self.level);
        validate_choice(&mut errors, config, "scopes", "scope", &self.scope);
        validate_choice(
            &mut errors,
            config,
            "types",
            "incident_type",
            &self.incident_type,
        );
        validate_choice(
            &mut errors,
            config,
            "impactOptions",
            "safety_compliance",
            &self.safety_compliance,
        );
        validate_choice(
            &mut errors,
            config,
            "impactOptions",
            "security_privacy",
            &self.security_privacy,
        );
        validate_choice(
            &mut errors,
            config,
            "impactOptions",
            "data_quality",
            &self.data_quality,
        );
        validate_choice(
            &mut errors,
            config,
            "impactOptions",
            "psd2_impact",
            &self.psd2_impact,
        );
        validate_choice(
            &mut errors,
            config,
            "timeFormats",
            "time_format",
            &self.time_format,
        );
        validate_choice(
            &mut errors,
            config,
            "detectionSources",
            "detection_source",
            &self.detection_source,
        );
        validate_email(&mut errors, "incident_commander", &self.incident_commander);

        errors.into_result()
    }

    // Only call after a successful validate: the datetimes are present then.
    pub fn into_incident(self, created_by: Option<String>) -> Incident {
        let now: DateTime = DateTime::now();

        Incident {
            _id: None,
            title: self.title,
            description: self.description,
            level: self.level,
            scope: self.scope,
            safety_compliance: self.safety_compliance,
            security_privacy: self.security_privacy,
            data_quality: self.data_quality,
            psd2_impact: self.psd2_impact,
            started_at: DateTime::from_chrono(self.started_at.unwrap()),
            detected_at: DateTime::from_chrono(self.detected_at.unwrap()),
            time_format: self.time_format,
            detection_source: self.detection_source,
            incident_type: self.incident_type,
            impacted_locations: self.impacted_locations,
            impacted_parties: self.impacted_parties,
            incident_commander: self.incident_commander,
            reporting_org: self.reporting_org,
            estimated_time_to_mitigation: self.estimated_time_to_mitigation,
            first_detected_in: self.first_detected_in,
            impacted_assets: self.impacted_assets,
            impacted_areas: self.impacted_areas,
            additional_subscribers: self.additional_subscribers,
            safety_compliance_document_url: self.safety_compliance_document_url,
            l5_confirmation: self.l5_confirmation,
            mitigation_policy_acknowledgment: self.mitigation_policy_acknowledgment,
            send_email_notifications: self.send_email_notifications,
            status: "reported".to_string(),
            created_at: now,
            updated_at: now,
            created_by,
        }
    }
}

impl IncidentPatch {
    pub fn validate(&self, config: &ChoiceConfig) -> Result<(), ValidationErrors> {
        let mut errors: ValidationErrors = ValidationErrors::default();

        if let (Some(started_at), Some(detected_at)) = (self.started_at, self.detected_at) {
            if detected_at < started_at {
                errors.add(
                    "detected_at",
                    "Detected at time cannot be before started at time.",
                );
            }
        }

        if self.level.as_deref() == Some("L5") {
            if !self.l5_confirmation.unwrap_or(false) {
                errors.add(
                    "l5_confirmation",
                    "L5 incident confirmation is required for L5 incidents.",
                );
            }
            let scope: &str = self.scope.as_deref().unwrap_or("");
            if (scope == "Medium" || scope == "High")
                && !self.mitigation_policy_acknowledgment.unwrap_or(false)
            {
                errors.add(
                    "mitigation_policy_acknowledgment",
                    "Mitigation policy acknowledgment is required for L5 Medium/High incidents.",
                );
            }
        }

        if let Some(level) = &self.level {
            validate_choice(&mut errors, config, "levels", "level", level);
        }
        if let Some(scope) = &self.scope {
            validate_choice(&mut errors, config, "scopes", "scope", scope);
        }
        if let Some(incident_type) = &self.incident_type {
            validate_choice(&mut errors, config, "types", "incident_type", incident_type);
        }
        if let Some(safety_compliance) = &self.safety_compliance {
            validate_choice(
                &mut errors,
                config,
                "impactOptions",
                "safety_compliance",
                safety_compliance,
            );
        }
        if let Some(security_privacy) = &self.security_privacy {
            validate_choice(
                &mut errors,
                config,
                "impactOptions",
                "security_privacy",
                security_privacy,
            );
        }
        if let Some(data_quality) = &self.data_quality {
            validate_choice(
                &mut errors,
                config,
                "impactOptions",
                "data_quality",
                data_quality,
            );
        }
        if let Some(psd2_impact) = &self.psd2_impact {
            validate_choice(
                &mut errors,
                config,
                "impactOptions",
                "psd2_impact",
                psd2_impact,
            );
        }
        if let Some(time_format) = &self.time_format {
            validate_choice(&mut errors, config, "timeFormats", "time_format", time_format);
        }
        if let Some(detection_source) = &self.detection_source {
            validate_choice(
                &mut errors,
                config,
                "detectionSources",
                "detection_source",
                detection_source,
            );
        }
        if let Some(status) = &self.status {
            validate_choice(&mut errors, config, "statuses", "status", status);
        }
        if let Some(incident_commander) = &self.incident_commander {
            validate_email(&mut errors, "incident_commander", incident_commander);
        }

        errors.into_result()
    }

    pub fn set_document(&self) -> Document {
        let mut set: Document = Document::new();

        if let Some(title) = &self.title {
            set.insert("title", title.clone());
        }
        if let Some(description) = &self.description {
            set.insert("description", description.clone());
        }
        if let Some(level) = &self.level {
            set.insert("level", level.clone());
        }
        if let Some(scope) = &self.scope {
            set.insert("scope", scope.clone());
        }
        if let Some(safety_compliance) = &self.safety_compliance {
            set.insert("safety_compliance", safety_compliance.clone());
        }
        if let Some(security_privacy) = &self.security_privacy {
            set.insert("security_privacy", security_privacy.clone());
        }
        if let Some(data_quality) = &self.data_quality {
            set.insert("data_quality", data_quality.clone());
        }
        if let Some(psd2_impact) = &self.psd2_impact {
            set.insert("psd2_impact", psd2_impact.clone());
        }
        if let Some(started_at) = self.started_at {
            set.insert("started_at", DateTime::from_chrono(started_at));
        }
        if let Some(detected_at) = self.detected_at {
            set.insert("detected_at", DateTime::from_chrono(detected_at));
        }
        if let Some(time_format) = &self.time_format {
            set.insert("time_format", time_format.clone());
        }
        if let Some(detection_source) = &self.detection_source {
            set.insert("detection_source", detection_source.clone());
        }
        if let Some(incident_type) = &self.incident_type {
            set.insert("incident_type", incident_type.clone());
        }
        if let Some(impacted_locations) = &self.impacted_locations {
            set.insert("impacted_locations", impacted_locations.clone());
        }
        if let Some(impacted_parties) = &self.impacted_parties {
            set.insert("impacted_parties", impacted_parties.clone());
        }
        if let Some(incident_commander) = &self.incident_commander {
            set.insert("incident_commander", incident_commander.clone());
        }
        if let Some(reporting_org) = &self.reporting_org {
            set.insert("reporting_org", reporting_org.clone());
        }
        if let Some(estimated_time_to_mitigation) = &self.estimated_time_to_mitigation {
            set.insert(
                "estimated_time_to_mitigation",
                estimated_time_to_mitigation.clone(),
            );
        }
        if let Some(first_detected_in) = &self.first_detected_in {
            set.insert("first_detected_in", first_detected_in.clone());
        }
        if let Some(impacted_assets) = &self.impacted_assets {
            set.insert("impacted_assets", impacted_assets.clone());
        }
        if let Some(impacted_areas) = &self.impacted_areas {
            set.insert("impacted_areas", impacted_areas.clone());
        }
        if let Some(additional_subscribers) = &self.additional_subscribers {
            set.insert("additional_subscribers", additional_subscribers.clone());
        }
        if let Some(safety_compliance_document_url) = &self.safety_compliance_document_url {
            set.insert(
                "safety_compliance_document_url",
                safety_compliance_document_url.clone(),
            );
        }
        if let Some(l5_confirmation) = self.l5_confirmation {
            set.insert("l5_confirmation", l5_confirmation);
        }
        if let Some(mitigation_policy_acknowledgment) = self.mitigation_policy_acknowledgment {
            set.insert(
                "mitigation_policy_acknowledgment",
                mitigation_policy_acknowledgment,
            );
        }
        if let Some(send_email_notifications) = self.send_email_notifications {
            set.insert("send_email_notifications", send_email_notifications);
        }
        if let Some(status) = &self.status {
            set.insert("status", status.clone());
        }

        set
    }
}

impl IncidentQuery {
    /// Builds the query from raw pairs so repeated parameters keep OR
    /// semantics instead of last-one-wins.
    pub fn from_pairs(pairs: &[(String, String)]) -> IncidentQuery {
        let mut query: IncidentQuery = IncidentQuery::default();

        for (name, value) in pairs.iter() {
            match name.as_str() {
                "level" => query.level.push(value.clone()),
                "scope" => query.scope.push(value.clone()),
                "status" => query.status.push(value.clone()),
                "incident_type" => query.incident_type.push(value.clone()),
                "detection_source" => query.detection_source.push(value.clone()),
                "reporting_org" => query.reporting_org.push(value.clone()),
                "incident_commander" => query.incident_commander.push(value.clone()),
                "impacted_assets" => query.impacted_assets.push(value.clone()),
                "impacted_areas" => query.impacted_areas.push(value.clone()),
                "impacted_locations" => query.impacted_locations = Some(value.clone()),
                "impacted_parties" => query.impacted_parties = Some(value.clone()),
                "search" => query.search = Some(value.clone()),
                "ordering" => query.ordering = Some(value.clone()),
                "page" => query.page = value.parse().ok(),
                "page_size" => query.page_size = value.parse().ok(),
                _ => (),
            }
        }
        query
    }

    pub fn filter_document(&self) -> Document {
        let mut filter: Document = Document::new();

        insert_any_of(&mut filter, "level", &self.level);
        insert_any_of(&mut filter, "scope", &self.scope);
        insert_any_of(&mut filter, "status", &self.status);
        insert_any_of(&mut filter, "incident_type", &self.incident_type);
        insert_any_of(&mut filter, "detection_source", &self.detection_source);
        insert_any_of(&mut filter, "reporting_org", &self.reporting_org);
        insert_any_of(&mut filter, "incident_commander", &self.incident_commander);
        insert_any_of(&mut filter, "impacted_assets", &self.impacted_assets);
        insert_any_of(&mut filter, "impacted_areas", &self.impacted_areas);

        if let Some(candidates) = &self.impacted_locations {
            insert_contains_any(&mut filter, "impacted_locations", candidates);
        }
        if let Some(candidates) = &self.impacted_parties {
            insert_contains_any(&mut filter, "impacted_parties", candidates);
        }

        if let Some(search) = &self.search {
            if !search.is_empty() {
                let pattern: String = regex::escape(search);
                let clauses: Vec<Document> =
                    ["title", "description", "incident_commander", "reporting_org"]
                        .iter()
                        .map(|field| {
                            let mut clause: Document = Document::new();
                            clause.insert(*field, doc! { "$regex": &pattern, "$options": "i" });
                            clause
                        })
                        .collect();
                filter.insert("$or", clauses);
            }
        }

        filter
    }

    pub fn sort_document(&self) -> Document {
        let (field, direction) = match self.ordering.as_deref() {
            Some(ordering) => {
                let (field, direction) = match ordering.strip_prefix('-') {
                    Some(field) => (field, -1),
                    None => (ordering, 1),
                };
                if ORDERING_FIELDS.contains(&field) {
                    (field, direction)
                } else {
                    ("created_at", -1)
                }
            }
            None => ("created_at", -1),
        };
        let mut sort: Document = Document::new();
        sort.insert(field, direction);
        sort
    }

    pub fn page_number(&self) -> u64 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn resolved_page_size(&self) -> u64 {
        self.page_size.unwrap_or_else(default_page_size).max(1)
    }
}

// Page size is a deployment concern, not part of the API contract.
fn default_page_size() -> u64 {
    std::env::var("PAGE_SIZE")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(20)
}

impl Incident {
    pub fn is_l5_high(&self) -> bool {
        self.level == "L5" && self.scope == "High"
    }
    pub fn requires_mitigation_policy(&self) -> bool {
        self.level == "L5" && (self.scope == "Medium" || self.scope == "High")
    }
    pub fn impacted_locations_display(&self) -> String {
        self.impacted_locations.join(", ")
    }
    pub fn impacted_parties_display(&self) -> String {
        self.impacted_parties.join(", ")
    }

    pub fn summary(&self) -> IncidentSummaryResponse {
        IncidentSummaryResponse {
            _id: self._id.map(|_id| _id.to_string()).unwrap_or_default(),
            title: self.title.clone(),
            description: self.description.clone(),
            level: self.level.clone(),
            scope: self.scope.clone(),
            incident_type: self.incident_type.clone(),
            status: self.status.clone(),
            incident_commander: self.incident_commander.clone(),
            started_at: self.started_at.to_chrono(),
            created_at: self.created_at.to_chrono(),
            updated_at: self.updated_at.to_chrono(),
            impacted_locations_display: self.impacted_locations_display(),
            impacted_parties_display: self.impacted_parties_display(),
            is_l5_high: self.is_l5_high(),
        }
    }

    pub fn detail(
        &self,
        documents: Vec<IncidentDocumentResponse>,
        updates: Vec<IncidentUpdateResponse>,
    ) -> IncidentResponse {
        IncidentResponse {
            _id: self._id.map(|_id| _id.to_string()).unwrap_or_default(),
            title: self.title.clone(),
            description: self.description.clone(),
            level: self.level.clone(),
            scope: self.scope.clone(),
            safety_compliance: self.safety_compliance.clone(),
            security_privacy: self.security_privacy.clone(),
            data_quality: self.data_quality.clone(),
            psd2_impact: self.psd2_impact.clone(),
            started_at: self.started_at.to_chrono(),
            detected_at: self.detected_at.to_chrono(),
            time_format: self.time_format.clone(),
            detection_source: self.detection_source.clone(),
            incident_type: self.incident_type.clone(),
            impacted_locations: self.impacted_locations.clone(),
            impacted_parties: self.impacted_parties.clone(),
            incident_commander: self.incident_commander.clone(),
            reporting_org: self.reporting_org.clone(),
            estimated_time_to_mitigation: self.estimated_time_to_mitigation.clone(),
            first_detected_in: self.first_detected_in.clone(),
            impacted_assets: self.impacted_assets.clone(),
            impacted_areas: self.impacted_areas.clone(),
            additional_subscribers: self.additional_subscribers.clone(),
            safety_compliance_document_url: self.safety_compliance_document_url.clone(),
            l5_confirmation: self.l5_confirmation,
            mitigation_policy_acknowledgment: self.mitigation_policy_acknowledgment,
            send_email_notifications: self.send_email_notifications,
            status: self.status.clone(),
            created_at: self.created_at.to_chrono(),
            updated_at: self.updated_at.to_chrono(),
            created_by: self.created_by.clone(),
            documents,
            updates,
            is_l5_high: self.is_l5_high(),
            requires_mitigation_policy: self.requires_mitigation_policy(),
            impacted_locations_display: self.impacted_locations_display(),
            impacted_parties_display: self.impacted_parties_display(),
        }
    }

    pub fn timeline(&self) -> IncidentTimeline {
        let time_to_detection: f64 =
            (self.detected_at.timestamp_millis() - self.started_at.timestamp_millis()) as f64
                / 1000.0;
        let time_since_started: f64 =
            (Utc::now().timestamp_millis() - self.started_at.timestamp_millis()) as f64 / 1000.0;

        IncidentTimeline {
            started_at: self.started_at.to_chrono(),
            detected_at: self.detected_at.to_chrono(),
            created_at: self.created_at.to_chrono(),
            updated_at: self.updated_at.to_chrono(),
            time_to_detection: Some(time_to_detection),
            time_since_started: Some(time_since_started),
        }
    }

    pub async fn save(&mut self) -> Result<ObjectId, String> {
        let db: Database = get_db();
        let collection: Collection<Incident> = db.collection::<Incident>("incidents");

        self._id = Some(ObjectId::new());

        collection
            .insert_one(self, None)
            .await
            .map_err(|_| "INSERTING_FAILED".to_string())
            .map(|result| result.inserted_id.as_object_id().unwrap())
    }

    pub async fn find_many(query: &IncidentQuery) -> Result<Vec<Incident>, String> {
        let db: Database = get_db();
        let collection: Collection<Incident> = db.collection::<Incident>("incidents");

        let page: u64 = query.page_number();
        let page_size: u64 = query.resolved_page_size();
        let options: FindOptions = FindOptions::builder()
            .sort(query.sort_document())
            .skip((page - 1) * page_size)
            .limit(page_size as i64)
            .build();

        let mut incidents: Vec<Incident> = Vec::new();
        if let Ok(mut cursor) = collection.find(query.filter_document(), options).await {
            while let Some(Ok(incident)) = cursor.next().await {
                incidents.push(incident);
            }
            Ok(incidents)
        } else {
            Err("INCIDENT_NOT_FOUND".to_string())
        }
    }

    pub async fn find_critical() -> Result<Vec<Incident>, String> {
        let db: Database = get_db();
        let collection: Collection<Incident> = db.collection::<Incident>("incidents");

        let options: FindOptions = FindOptions::builder()
            .sort(doc! { "created_at": -1 })
            .build();

        let mut incidents: Vec<Incident> = Vec::new();
        if let Ok(mut cursor) = collection.find(critical_filter(), options).await {
            while let Some(Ok(incident)) = cursor.next().await {
                incidents.push(incident);
            }
            Ok(incidents)
        } else {
            Err("INCIDENT_NOT_FOUND".to_string())
        }
    }

    pub async fn find_by_id(_id: &ObjectId) -> Result<Option<Incident>, String> {
        let db: Database = get_db();
        let collection: Collection<Incident> = db.collection::<Incident>("incidents");

        collection
            .find_one(doc! { "_id": _id }, None)
            .await
            .map_err(|_| "INCIDENT_NOT_FOUND".to_string())
    }

    pub async fn count(filter: Document) -> Result<u64, String> {
        let db: Database = get_db();
        let collection: Collection<Incident> = db.collection::<Incident>("incidents");

        collection
            .count_documents(filter, None)
            .await
            .map_err(|_| "COUNTING_FAILED".to_string())
    }

    pub async fn update_by_id(_id: &ObjectId, patch: &IncidentPatch) -> Result<ObjectId, String> {
        let db: Database = get_db();
        let collection: Collection<Incident> = db.collection::<Incident>("incidents");

        let mut set: Document = patch.set_document();
        set.insert("updated_at", DateTime::now());

        collection
            .update_one(doc! { "_id": _id }, doc! { "$set": set }, None)
            .await
            .map_err(|_| "UPDATE_FAILED".to_string())
            .map(|_| *_id)
    }

    // The status set is validated in the route; any member may follow any other.
    pub async fn update_status(_id: &ObjectId, status: &str) -> Result<ObjectId, String> {
        let db: Database = get_db();
        let collection: Collection<Incident> = db.collection::<Incident>("incidents");

        collection
            .update_one(
                doc! { "_id": _id },
                doc! { "$set": { "status": status, "updated_at": DateTime::now() } },
                None,
            )
            .await
            .map_err(|_| "UPDATE_FAILED".to_string())
            .map(|_| *_id)
    }

    // Children go first so they can never outlive the incident.
    pub async fn delete_by_id(_id: &ObjectId) -> Result<u64, String> {
        use super::incident_document::IncidentDocument;
        use super::incident_update::IncidentUpdate;

        IncidentDocument::delete_by_incident(_id).await?;
        IncidentUpdate::delete_by_incident(_id).await?;

        let db: Database = get_db();
        let collection: Collection<Incident> = db.collection::<Incident>("incidents");

        collection
            .delete_one(doc! { "_id": _id }, None)
            .await
            .map_err(|_| "INCIDENT_NOT_FOUND".to_string())
            .map(|result| result.deleted_count)
    }

    pub async fn statistics(filter: Document) -> Result<IncidentStatistics, String> {
        let db: Database = get_db();
        let collection: Collection<Incident> = db.collection::<Incident>("incidents");

        Ok(IncidentStatistics {
            total_incidents: count_where(&collection, &filter, Document::new()).await?,
            by_level: LevelBreakdown {
                l2: count_where(&collection, &filter, doc! { "level": "L2" }).await?,
                l3: count_where(&collection, &filter, doc! { "level": "L3" }).await?,
                l4: count_where(&collection, &filter, doc! { "level": "L4" }).await?,
                l5: count_where(&collection, &filter, doc! { "level": "L5" }).await?,
            },
            by_scope: ScopeBreakdown {
                low: count_where(&collection, &filter, doc! { "scope": "Low" }).await?,
                medium: count_where(&collection, &filter, doc! { "scope": "Medium" }).await?,
                high: count_where(&collection, &filter, doc! { "scope": "High" }).await?,
            },
            by_status: StatusBreakdown {
                reported: count_where(&collection, &filter, doc! { "status": "reported" }).await?,
                mitigating: count_where(&collection, &filter, doc! { "status": "mitigating" })
                    .await?,
                resolved: count_where(&collection, &filter, doc! { "status": "resolved" }).await?,
                postmortem: count_where(&collection, &filter, doc! { "status": "postmortem" })
                    .await?,
                closed: count_where(&collection, &filter, doc! { "status": "closed" }).await?,
            },
            l5_high_incidents: count_where(
                &collection,
                &filter,
                doc! { "level": "L5", "scope": "High" },
            )
            .await?,
            critical_incidents: count_where(&collection, &filter, critical_filter()).await?,
        })
    }
}

async fn count_where(
    collection: &Collection<Incident>,
    base: &Document,
    extra: Document,
) -> Result<u64, String> {
    collection
        .count_documents(and_filter(base, extra), None)
        .await
        .map_err(|_| "COUNTING_FAILED".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChoiceConfig;

    const RAW_CONFIG: &str = r#"{
        "incident": {
            "levels": [
                { "value": "L2", "label": "L2" },
                { "value": "L3", "label": "L3" },
                { "value": "L4", "label": "L4" },
                { "value": "L5", "label": "L5" }
            ],
            "scopes": [
                { "value": "Low", "label": "Low" },
                { "value": "Medium", "label": "Medium" },
                { "value": "High", "label": "High" }
            ],
            "types": [
                { "value": "Planned", "label": "Planned" },
                { "value": "Outage", "label": "Outage" },
                { "value": "External", "label": "External" },
                { "value": "Test", "label": "Test" }
            ],
            "statuses": [
                { "value": "reported", "label": "Reported" },
                { "value": "mitigating", "label": "Mitigating" },
                { "value": "resolved", "label": "Resolved" },
                { "value": "postmortem", "label": "Postmortem" },
                { "value": "closed", "label": "Closed" }
            ],
            "impactOptions": [
                { "value": "None", "label": "None" },
                { "value": "Low", "label": "Low" },
                { "value": "High", "label": "High" }
            ],
            "timeFormats": [
                { "value": "Local Time", "label": "Local Time" },
                { "value": "UTC", "label": "UTC" }
            ],
            "detectionSources": [
                { "value": "Alert", "label": "Alert" },
                { "value": "Manual", "label": "Manual" }
            ],
            "impactedLocations": [],
            "impactedParties": []
        }
    }"#;

    fn config() -> ChoiceConfig {
        ChoiceConfig::from_json(RAW_CONFIG).unwrap()
    }

    fn request_from(payload: &str) -> IncidentRequest {
        serde_json::from_str::<IncidentRequest>(payload).unwrap()
    }

    fn base_request() -> IncidentRequest {
        request_from(
            r#"{
                "title": "Checkout latency",
                "description": "Elevated error rate on checkout",
                "level": "L3",
                "scope": "Low",
                "startedAt": "2024-05-01T10:00:00Z",
                "incidentDetectedAt": "2024-05-01T10:30:00Z",
                "incidentCommander": "commander@example.com",
                "reportingOrg": "Payments"
            }"#,
        )
    }

    fn sample_incident() -> Incident {
        base_request().into_incident(None)
    }

    fn pairs(raw: &[(&str, &str)]) -> Vec<(String, String)> {
        raw.iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn valid_request_passes() {
        assert!(base_request().validate(&config()).is_ok());
    }

    #[test]
    fn camel_case_aliases_map_onto_stored_names() {
        let request = request_from(
            r#"{
                "title": "t",
                "startedAt": "2024-05-01T10:00:00Z",
                "incidentDetectedAt": "2024-05-01T10:30:00Z",
                "safetyCompliance": "Low",
                "psd2Impact": "High",
                "impactedAssets": ["ledger"],
                "impactedAreas": ["payments-api"],
                "scImpactDocumentUrl": "https://example.com/doc",
                "l5Confirmation": true,
                "mitigationPolicyAcknowledgment": true,
                "sendEmailNotifications": false,
                "estimatedTimeToMitigation": "2h",
                "relatedDocuments": [{ "title": "Runbook", "url": "https://example.com/rb" }]
            }"#,
        );

        assert_eq!(request.safety_compliance, "Low");
        assert_eq!(request.psd2_impact, "High");
        assert_eq!(request.impacted_assets, vec!["ledger"]);
        assert_eq!(request.impacted_areas, vec!["payments-api"]);
        assert_eq!(request.safety_compliance_document_url, "https://example.com/doc");
        assert!(request.l5_confirmation);
        assert!(!request.send_email_notifications);
        assert_eq!(request.estimated_time_to_mitigation, "2h");
        assert_eq!(request.related_documents.len(), 1);

        let serialized = serde_json::to_value(&request).unwrap();
        assert!(serialized.get("incidentDetectedAt").is_some());
        assert!(serialized.get("scImpactDocumentUrl").is_some());
        assert!(serialized.get("detected_at").is_none());
    }

    #[test]
    fn request_defaults_apply() {
        let request = request_from(
            r#"{
                "title": "t",
                "startedAt": "2024-05-01T10:00:00Z",
                "incidentDetectedAt": "2024-05-01T10:30:00Z"
            }"#,
        );
        assert_eq!(request.time_format, "Local Time");
        assert_eq!(request.detection_source, "Manual");
        assert_eq!(request.incident_type, "Planned");
        assert_eq!(request.estimated_time_to_mitigation, "unknown");
        assert!(request.send_email_notifications);
        assert!(request.impacted_locations.is_empty());

        let incident = request.into_incident(Some("actor@example.com".to_string()));
        assert_eq!(incident.status, "reported");
        assert_eq!(incident.created_by.as_deref(), Some("actor@example.com"));
        assert_eq!(incident.created_at, incident.updated_at);
    }

    #[test]
    fn missing_datetimes_error_on_their_fields() {
        let request = request_from(r#"{ "title": "t" }"#);
        let errors = request.validate(&config()).unwrap_err();
        assert!(errors.0.contains_key("started_at"));
        assert!(errors.0.contains_key("detected_at"));
    }

    #[test]
    fn detected_before_started_is_rejected() {
        let mut request = base_request();
        std::mem::swap(&mut request.started_at, &mut request.detected_at);
        let errors = request.validate(&config()).unwrap_err();
        assert_eq!(
            errors.0["detected_at"],
            vec!["Detected at time cannot be before started at time."]
        );
    }

    #[test]
    fn l5_requires_confirmation_for_every_scope() {
        for scope in ["", "Low", "Medium", "High"] {
            let mut request = base_request();
            request.level = "L5".to_string();
            request.scope = scope.to_string();
            request.mitigation_policy_acknowledgment = true;

            let errors = request.validate(&config()).unwrap_err();
            assert!(errors.0.contains_key("l5_confirmation"), "scope {scope:?}");
        }
    }

    #[test]
    fn l5_medium_high_require_mitigation_acknowledgment() {
        for (scope, required) in [("Low", false), ("Medium", true), ("High", true)] {
            let mut request = base_request();
            request.level = "L5".to_string();
            request.scope = scope.to_string();
            request.l5_confirmation = true;

            let result = request.validate(&config());
            if required {
                let errors = result.unwrap_err();
                assert!(errors.0.contains_key("mitigation_policy_acknowledgment"));
            } else {
                assert!(result.is_ok());
            }
        }
    }

    #[test]
    fn mitigation_rule_is_independent_of_confirmation() {
        let mut request = base_request();
        request.level = "L5".to_string();
        request.scope = "High".to_string();

        let errors = request.validate(&config()).unwrap_err();
        assert!(errors.0.contains_key("l5_confirmation"));
        assert!(errors.0.contains_key("mitigation_policy_acknowledgment"));
    }

    #[test]
    fn unknown_choice_values_are_rejected() {
        let mut request = base_request();
        request.level = "L9".to_string();
        request.detection_source = "Psychic".to_string();

        let errors = request.validate(&config()).unwrap_err();
        assert_eq!(errors.0["level"], vec!["\"L9\" is not a valid choice."]);
        assert!(errors.0.contains_key("detection_source"));
    }

    #[test]
    fn blank_optional_enums_are_accepted() {
        let mut request = base_request();
        request.level = String::new();
        request.scope = String::new();
        request.safety_compliance = String::new();
        assert!(request.validate(&config()).is_ok());
    }

    #[test]
    fn commander_email_is_checked() {
        let mut request = base_request();
        request.incident_commander = "not-an-email".to_string();
        let errors = request.validate(&config()).unwrap_err();
        assert_eq!(errors.0["incident_commander"], vec!["Enter a valid email address."]);
    }

    #[test]
    fn is_l5_high_truth_table() {
        for level in ["L2", "L3", "L4", "L5"] {
            for scope in ["Low", "Medium", "High"] {
                let mut incident = sample_incident();
                incident.level = level.to_string();
                incident.scope = scope.to_string();
                assert_eq!(
                    incident.is_l5_high(),
                    level == "L5" && scope == "High",
                    "{level}/{scope}"
                );
            }
        }
    }

    #[test]
    fn requires_mitigation_policy_truth_table() {
        for level in ["L2", "L3", "L4", "L5"] {
            for scope in ["Low", "Medium", "High"] {
                let mut incident = sample_incident();
                incident.level = level.to_string();
                incident.scope = scope.to_string();
                assert_eq!(
                    incident.requires_mitigation_policy(),
                    level == "L5" && (scope == "Medium" || scope == "High"),
                    "{level}/{scope}"
                );
            }
        }
    }

    #[test]
    fn display_fields_join_arrays() {
        let mut incident = sample_incident();
        incident.impacted_locations = vec!["EU".to_string(), "US".to_string()];
        assert_eq!(incident.impacted_locations_display(), "EU, US");
        assert_eq!(incident.impacted_parties_display(), "");
    }

    #[test]
    fn timeline_reports_detection_delay_in_seconds() {
        let incident = sample_incident();
        let timeline = incident.timeline();
        assert_eq!(timeline.time_to_detection, Some(1800.0));
        assert!(timeline.time_since_started.unwrap() > 0.0);
    }

    #[test]
    fn repeated_parameters_become_an_in_clause() {
        let query = IncidentQuery::from_pairs(&pairs(&[
            ("status", "reported"),
            ("status", "resolved"),
        ]));
        assert_eq!(
            query.filter_document(),
            doc! { "status": { "$in": ["reported", "resolved"] } }
        );
    }

    #[test]
    fn comma_separated_locations_match_any_member() {
        let query = IncidentQuery::from_pairs(&pairs(&[("impacted_locations", "EU, US")]));
        assert_eq!(
            query.filter_document(),
            doc! { "impacted_locations": { "$in": ["EU", "US"] } }
        );
    }

    #[test]
    fn absent_parameters_impose_no_constraint() {
        let query = IncidentQuery::from_pairs(&pairs(&[("page", "2")]));
        assert!(query.filter_document().is_empty());
        assert_eq!(query.page_number(), 2);
    }

    #[test]
    fn search_is_an_escaped_contains_across_four_fields() {
        let query = IncidentQuery::from_pairs(&pairs(&[("search", "a+b")]));
        let filter = query.filter_document();

        let clauses = filter.get_array("$or").unwrap();
        assert_eq!(clauses.len(), 4);
        let first = clauses[0].as_document().unwrap();
        assert_eq!(
            first.get_document("title").unwrap().get_str("$regex").unwrap(),
            "a\\+b"
        );
    }

    #[test]
    fn ordering_defaults_to_newest_created_first() {
        let query = IncidentQuery::default();
        assert_eq!(query.sort_document(), doc! { "created_at": -1 });

        let query = IncidentQuery::from_pairs(&pairs(&[("ordering", "started_at")]));
        assert_eq!(query.sort_document(), doc! { "started_at": 1 });

        let query = IncidentQuery::from_pairs(&pairs(&[("ordering", "-level")]));
        assert_eq!(query.sort_document(), doc! { "level": -1 });

        let query = IncidentQuery::from_pairs(&pairs(&[("ordering", "password")]));
        assert_eq!(query.sort_document(), doc! { "created_at": -1 });
    }

    #[test]
    fn patch_writes_only_supplied_fields() {
        let patch = IncidentPatch {
            status: Some("mitigating".to_string()),
            impacted_assets: Some(vec!["ledger".to_string()]),
            ..IncidentPatch::default()
        };

        let set = patch.set_document();
        assert_eq!(set.len(), 2);
        assert_eq!(set.get_str("status").unwrap(), "mitigating");
        assert!(IncidentPatch::default().set_document().is_empty());
    }

    #[test]
    fn patch_validates_supplied_values_only() {
        let patch = IncidentPatch {
            status: Some("archived".to_string()),
            ..IncidentPatch::default()
        };
        let errors = patch.validate(&config()).unwrap_err();
        assert!(errors.0.contains_key("status"));

        // untouched fields are not re-validated
        assert!(IncidentPatch::default().validate(&config()).is_ok());
    }

    #[test]
    fn patch_applies_l5_rules_when_level_is_supplied() {
        let patch = IncidentPatch {
            level: Some("L5".to_string()),
            scope: Some("Medium".to_string()),
            ..IncidentPatch::default()
        };
        let errors = patch.validate(&config()).unwrap_err();
        assert!(errors.0.contains_key("l5_confirmation"));
        assert!(errors.0.contains_key("mitigation_policy_acknowledgment"));
    }

    #[test]
    fn and_filter_keeps_both_sides() {
        let base = doc! { "status": "reported" };
        assert_eq!(
            and_filter(&base, doc! { "level": "L5" }),
            doc! { "$and": [{ "status": "reported" }, { "level": "L5" }] }
        );
        assert_eq!(and_filter(&Document::new(), doc! { "level": "L5" }), doc! { "level": "L5" });
        assert_eq!(and_filter(&base, Document::new()), base);
    }

    #[test]
    fn critical_filter_targets_l5_medium_and_high() {
        assert_eq!(
            critical_filter(),
            doc! { "level": "L5", "scope": { "$in": ["Medium", "High"] } }
        );
    }

    #[test]
    fn validation_errors_serialize_as_field_message_map() {
        let mut errors = ValidationErrors::default();
        errors.add("detected_at", "Detected at time is required.");

        let value = serde_json::to_value(&errors).unwrap();
        assert_eq!(
            value,
            serde_json::json!({ "detected_at": ["Detected at time is required."] })
        );
    }
}
