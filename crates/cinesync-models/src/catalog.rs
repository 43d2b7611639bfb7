use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A movie as described by the upstream catalog.
///
/// `id` is the external catalog ID and never changes once assigned. `title` is
/// optional here because upstream data is imperfect; records without one are
/// rejected at upsert time rather than at parse time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CatalogItem {
    pub id: u64,
    pub title: Option<String>,
    pub original_title: Option<String>,
    pub release_date: Option<NaiveDate>,
    pub overview: Option<String>,
    pub tagline: Option<String>,
    pub poster_path: Option<String>,
    pub backdrop_path: Option<String>,
    pub popularity: Option<f64>,
    pub vote_average: Option<f64>,
    pub vote_count: Option<u64>,
    pub runtime: Option<u32>,
    pub status: Option<String>,
    #[serde(default)]
    pub adult: bool,
    pub original_language: Option<String>,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub credits: Vec<CreditEntry>,
    #[serde(default)]
    pub keywords: Vec<KeywordEntry>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CreditKind {
    Cast,
    Crew,
}

impl CreditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditKind::Cast => "cast",
            CreditKind::Crew => "crew",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "cast" => Some(CreditKind::Cast),
            "crew" => Some(CreditKind::Crew),
            _ => None,
        }
    }
}

/// One cast or crew line for a movie, carrying enough of the person to
/// get-or-create them in the people dictionary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreditEntry {
    pub person_id: u64,
    pub name: String,
    pub kind: CreditKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_for_department: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeywordEntry {
    pub id: u64,
    pub name: String,
}
