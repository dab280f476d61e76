//! Canonical data shapes shared by every stage of the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The fixed set of text-derived flags.
///
/// The keyword table decides which terms trigger a flag; it cannot add flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeywordFlag {
    Fire,
    Propane,
    Weapon,
    FaceDown,
    TentsPresent,
    Wheelchair,
    Children,
    BlockingAccess,
    OnRamp,
    Needles,
    Injecting,
    PassedOut,
    PrivateProperty,
    Duplicate,
    UnableToLocate,
}

impl KeywordFlag {
    pub const ALL: [KeywordFlag; 15] = [
        KeywordFlag::Fire,
        KeywordFlag::Propane,
        KeywordFlag::Weapon,
        KeywordFlag::FaceDown,
        KeywordFlag::TentsPresent,
        KeywordFlag::Wheelchair,
        KeywordFlag::Children,
        KeywordFlag::BlockingAccess,
        KeywordFlag::OnRamp,
        KeywordFlag::Needles,
        KeywordFlag::Injecting,
        KeywordFlag::PassedOut,
        KeywordFlag::PrivateProperty,
        KeywordFlag::Duplicate,
        KeywordFlag::UnableToLocate,
    ];

    /// Column name in every output format.
    pub fn name(self) -> &'static str {
        match self {
            KeywordFlag::Fire => "fire",
            KeywordFlag::Propane => "propane",
            KeywordFlag::Weapon => "weapon",
            KeywordFlag::FaceDown => "face_down",
            KeywordFlag::TentsPresent => "tents_present",
            KeywordFlag::Wheelchair => "wheelchair",
            KeywordFlag::Children => "children",
            KeywordFlag::BlockingAccess => "blocking_access",
            KeywordFlag::OnRamp => "on_ramp",
            KeywordFlag::Needles => "needles",
            KeywordFlag::Injecting => "injecting",
            KeywordFlag::PassedOut => "passed_out",
            KeywordFlag::PrivateProperty => "private_property",
            KeywordFlag::Duplicate => "duplicate",
            KeywordFlag::UnableToLocate => "unable_to_locate",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        KeywordFlag::ALL.iter().copied().find(|f| f.name() == name)
    }
}

/// Freshly computed keyword flags. All false unless the text gives positive evidence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordFlags {
    pub fire: bool,
    pub propane: bool,
    pub weapon: bool,
    pub face_down: bool,
    pub tents_present: bool,
    pub wheelchair: bool,
    pub children: bool,
    pub blocking_access: bool,
    pub on_ramp: bool,
    pub needles: bool,
    pub injecting: bool,
    pub passed_out: bool,
    pub private_property: bool,
    pub duplicate: bool,
    pub unable_to_locate: bool,
}

impl KeywordFlags {
    pub fn get(&self, flag: KeywordFlag) -> bool {
        match flag {
            KeywordFlag::Fire => self.fire,
            KeywordFlag::Propane => self.propane,
            KeywordFlag::Weapon => self.weapon,
            KeywordFlag::FaceDown => self.face_down,
            KeywordFlag::TentsPresent => self.tents_present,
            KeywordFlag::Wheelchair => self.wheelchair,
            KeywordFlag::Children => self.children,
            KeywordFlag::BlockingAccess => self.blocking_access,
            KeywordFlag::OnRamp => self.on_ramp,
            KeywordFlag::Needles => self.needles,
            KeywordFlag::Injecting => self.injecting,
            KeywordFlag::PassedOut => self.passed_out,
            KeywordFlag::PrivateProperty => self.private_property,
            KeywordFlag::Duplicate => self.duplicate,
            KeywordFlag::UnableToLocate => self.unable_to_locate,
        }
    }

    pub fn set(&mut self, flag: KeywordFlag, value: bool) {
        let slot = match flag {
            KeywordFlag::Fire => &mut self.fire,
            KeywordFlag::Propane => &mut self.propane,
            KeywordFlag::Weapon => &mut self.weapon,
            KeywordFlag::FaceDown => &mut self.face_down,
            KeywordFlag::TentsPresent => &mut self.tents_present,
            KeywordFlag::Wheelchair => &mut self.wheelchair,
            KeywordFlag::Children => &mut self.children,
            KeywordFlag::BlockingAccess => &mut self.blocking_access,
            KeywordFlag::OnRamp => &mut self.on_ramp,
            KeywordFlag::Needles => &mut self.needles,
            KeywordFlag::Injecting => &mut self.injecting,
            KeywordFlag::PassedOut => &mut self.passed_out,
            KeywordFlag::PrivateProperty => &mut self.private_property,
            KeywordFlag::Duplicate => &mut self.duplicate,
            KeywordFlag::UnableToLocate => &mut self.unable_to_locate,
        };
        *slot = value;
    }

    /// Flags that are set, in `KeywordFlag::ALL` order.
    pub fn active(&self) -> Vec<KeywordFlag> {
        KeywordFlag::ALL.iter().copied().filter(|f| self.get(*f)).collect()
    }
}

/// Upstream heuristic tags, carried through untouched for later comparison.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceTags {
    pub tag_safety_issue: Option<bool>,
    pub tag_drugs: Option<bool>,
    pub tag_person_position: Option<String>,
    pub tag_lying_face_down: Option<bool>,
    pub tag_tents_present: Option<bool>,
    pub tag_size_feet: Option<f64>,
    pub tag_num_people: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Ok,
    Failed,
}

impl FetchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FetchStatus::Ok => "ok",
            FetchStatus::Failed => "failed",
        }
    }
}

/// Image cache state for each photo URL, index-aligned with `photo_urls`.
/// `None` means the URL has no manifest entry yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageMeta {
    pub image_paths: Vec<Option<String>>,
    pub image_checksums: Vec<Option<String>>,
    pub image_fetch_status: Vec<Option<FetchStatus>>,
}

/// One normalized complaint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRequest {
    pub request_id: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub status: Option<String>,
    pub status_notes: Option<String>,
    pub category: Option<String>,
    pub district: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub text: Option<String>,
    pub text_truncated: bool,
    pub desc_len: u64,
    pub photo_urls: Vec<String>,
    pub has_photo: bool,
    #[serde(flatten)]
    pub features: KeywordFlags,
    pub responder_goa: bool,
    pub num_people_bin: String,
    pub size_feet_bin: String,
    #[serde(flatten)]
    pub images: ImageMeta,
    #[serde(flatten)]
    pub provenance: ProvenanceTags,
    pub keyword_table_version: String,
}

/// A record that normalization rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedRecord {
    /// 0-based position in the source stream
    pub position: usize,
    pub request_id: Option<String>,
    pub reason: String,
}
