//! Evidence records as submitted by callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::canonical::{self, sha256_hex};
use crate::error::{LedgerError, Result};

pub const TITLE_MIN_LEN: usize = 5;
pub const TITLE_MAX_LEN: usize = 500;
pub const DESCRIPTION_MIN_LEN: usize = 10;
pub const MAX_TAGS: usize = 20;

/// Parse one of the lowercase string enums below through its serde names.
fn parse_variant<T: serde::de::DeserializeOwned>(kind: &str, value: &str) -> std::result::Result<T, String> {
    serde_json::from_value(Value::String(value.to_string())).map_err(|_| format!("Unknown {}: {}", kind, value))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceType {
    ClinicalStudy,
    ResearchPaper,
    CaseReport,
    DiagnosticImage,
    LabResult,
    PathologyReport,
    SurgicalNote,
    TreatmentProtocol,
    PatientOutcome,
    AdverseEvent,
    DrugInteraction,
    BiomarkerData,
    GenomicData,
    ClinicalTrial,
    Guideline,
    SystematicReview,
    MetaAnalysis,
    ExpertOpinion,
}

impl EvidenceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceType::ClinicalStudy => "clinical_study",
            EvidenceType::ResearchPaper => "research_paper",
            EvidenceType::CaseReport => "case_report",
            EvidenceType::DiagnosticImage => "diagnostic_image",
            EvidenceType::LabResult => "lab_result",
            EvidenceType::PathologyReport => "pathology_report",
            EvidenceType::SurgicalNote => "surgical_note",
            EvidenceType::TreatmentProtocol => "treatment_protocol",
            EvidenceType::PatientOutcome => "patient_outcome",
            EvidenceType::AdverseEvent => "adverse_event",
            EvidenceType::DrugInteraction => "drug_interaction",
            EvidenceType::BiomarkerData => "biomarker_data",
            EvidenceType::GenomicData => "genomic_data",
            EvidenceType::ClinicalTrial => "clinical_trial",
            EvidenceType::Guideline => "guideline",
            EvidenceType::SystematicReview => "systematic_review",
            EvidenceType::MetaAnalysis => "meta_analysis",
            EvidenceType::ExpertOpinion => "expert_opinion",
        }
    }
}

impl FromStr for EvidenceType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        parse_variant("evidence type", s)
    }
}

impl fmt::Display for EvidenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// GRADE-style quality rating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceQuality {
    GradeA,
    GradeB,
    GradeC,
    GradeD,
    #[default]
    Ungraded,
}

impl EvidenceQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceQuality::GradeA => "grade_a",
            EvidenceQuality::GradeB => "grade_b",
            EvidenceQuality::GradeC => "grade_c",
            EvidenceQuality::GradeD => "grade_d",
            EvidenceQuality::Ungraded => "ungraded",
        }
    }
}

impl FromStr for EvidenceQuality {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        parse_variant("evidence quality", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StudyDesign {
    #[serde(rename = "rct")]
    RandomizedControlledTrial,
    #[serde(rename = "cohort")]
    CohortStudy,
    CaseControl,
    CrossSectional,
    CaseSeries,
    SystematicReview,
    MetaAnalysis,
    NarrativeReview,
    ExpertOpinion,
}

impl FromStr for StudyDesign {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        parse_variant("study design", s)
    }
}

/// Quality and provenance attached to a record. Every field is always
/// present in the canonical form; unset values serialize as `null` or `[]`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EvidenceMetadata {
    pub evidence_quality: EvidenceQuality,
    /// In `[0, 1]`.
    pub confidence_level: f64,
    pub peer_reviewed: bool,
    pub authors: Vec<String>,
    pub institution: Option<String>,
    #[serde(with = "canonical::option_timestamp")]
    pub publication_date: Option<DateTime<Utc>>,
    pub journal: Option<String>,
    pub doi: Option<String>,
    pub pmid: Option<String>,
    pub study_design: Option<StudyDesign>,
    pub sample_size: Option<u64>,
    pub population: Option<String>,
    pub intervention: Option<String>,
    pub outcome_measures: Vec<String>,
    pub indication: Option<String>,
    pub country: Option<String>,
    pub related_evidence: Vec<String>,
    pub external_links: Vec<String>,
}

/// A clinical evidentiary artifact. Immutable once stored; changes are new
/// records that name the old one in `supersedes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    /// Empty until assigned by [`EvidenceRecord::ensure_id`] or at store time.
    pub evidence_id: String,
    pub evidence_type: EvidenceType,
    pub title: String,
    pub description: String,
    pub content: Option<Value>,
    pub metadata: EvidenceMetadata,
    pub source: String,
    pub created_by: Option<String>,
    pub tags: Vec<String>,
    pub clinical_context: Map<String, Value>,
    #[serde(with = "canonical::timestamp")]
    pub created_at: DateTime<Utc>,
    pub supersedes: Option<String>,
}

/// `EVD_<yyyymmddHHMMSSffffff>_<16 hex of sha256(body)>`, where `body` is the
/// canonical record without its id. Resubmitting the same record yields the
/// same id.
pub fn generate_evidence_id(created_at: &DateTime<Utc>, body: &[u8]) -> String {
    format!(
        "EVD_{}_{}",
        created_at.format("%Y%m%d%H%M%S%6f"),
        &sha256_hex(body)[..16]
    )
}

fn is_well_formed_id(id: &str) -> bool {
    let mut parts = id.split('_');
    matches!(
        (parts.next(), parts.next(), parts.next(), parts.next()),
        (Some("EVD"), Some(ts), Some(h), None)
            if ts.len() == 20
                && ts.bytes().all(|b| b.is_ascii_digit())
                && h.len() == 16
                && h.bytes().all(|b| b.is_ascii_hexdigit())
    )
}

impl EvidenceRecord {
    pub fn new(
        evidence_type: EvidenceType,
        title: impl Into<String>,
        description: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            evidence_id: String::new(),
            evidence_type,
            title: title.into(),
            description: description.into(),
            content: None,
            metadata: EvidenceMetadata::default(),
            source: source.into(),
            created_by: None,
            tags: Vec::new(),
            clinical_context: Map::new(),
            created_at: canonical::now(),
            supersedes: None,
        }
    }

    pub fn with_content(mut self, content: impl Into<Value>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_metadata(mut self, metadata: EvidenceMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_creator(mut self, created_by: impl Into<String>) -> Self {
        self.created_by = Some(created_by.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_clinical_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clinical_context.insert(key.into(), value.into());
        self
    }

    /// Assign an evidence id if none is set and return it. The id is
    /// derived from the record body, so the same record always gets the
    /// same id.
    pub fn ensure_id(&mut self) -> Result<&str> {
        if self.evidence_id.is_empty() {
            // The id is still empty here, so it does not feed its own hash.
            let body = canonical::canonical_bytes(&*self)?;
            self.evidence_id = generate_evidence_id(&self.created_at, &body);
        }
        Ok(&self.evidence_id)
    }

    /// Trim the title, lowercase and dedupe tags, and truncate the creation
    /// time to canonical precision.
    pub fn normalize(&mut self) {
        self.title = self.title.trim().to_string();
        let mut tags: Vec<String> = Vec::with_capacity(self.tags.len());
        for tag in self.tags.drain(..) {
            let tag = tag.trim().to_lowercase();
            if !tag.is_empty() && !tags.contains(&tag) {
                tags.push(tag);
            }
        }
        self.tags = tags;
        self.created_at = canonical::normalize_timestamp(self.created_at);
    }

    pub fn validate(&self) -> Result<()> {
        if !self.evidence_id.is_empty() && !is_well_formed_id(&self.evidence_id) {
            return Err(LedgerError::invalid_field("evidence_id", "malformed"));
        }
        let title_len = self.title.trim().chars().count();
        if !(TITLE_MIN_LEN..=TITLE_MAX_LEN).contains(&title_len) {
            return Err(LedgerError::invalid_field(
                "title",
                &format!("must be {}-{} characters", TITLE_MIN_LEN, TITLE_MAX_LEN),
            ));
        }
        if self.description.trim().chars().count() < DESCRIPTION_MIN_LEN {
            return Err(LedgerError::invalid_field(
                "description",
                &format!("must be at least {} characters", DESCRIPTION_MIN_LEN),
            ));
        }
        if self.source.trim().is_empty() {
            return Err(LedgerError::invalid_field("source", "must not be empty"));
        }
        if self.tags.len() > MAX_TAGS {
            return Err(LedgerError::invalid_field("tags", &format!("at most {} allowed", MAX_TAGS)));
        }
        let confidence = self.metadata.confidence_level;
        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            return Err(LedgerError::invalid_field("metadata.confidence_level", "must be within [0, 1]"));
        }
        if self.supersedes.is_some() && self.supersedes.as_deref() == Some(self.evidence_id.as_str()) {
            return Err(LedgerError::invalid_field("supersedes", "a record cannot supersede itself"));
        }
        Ok(())
    }
}
