//! Curriculum-side inputs: what to teach, at which level, from which books.

use serde::{Deserialize, Serialize};

/// Academic degree level of the curriculum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcademicDegree {
    Bachelor,
    Master,
    Phd,
}

impl AcademicDegree {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bachelor => "bachelor",
            Self::Master => "master",
            Self::Phd => "phd",
        }
    }
}

impl std::fmt::Display for AcademicDegree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AcademicDegree {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "bachelor" | "бакалавриат" => Ok(Self::Bachelor),
            "master" | "магистратура" => Ok(Self::Master),
            "phd" | "аспирантура" => Ok(Self::Phd),
            other => Err(format!("unknown academic degree: {other}")),
        }
    }
}

/// A lecture topic: the theme plus the level and discipline it is taught at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub theme: String,
    pub degree: AcademicDegree,
    pub discipline: String,
}

impl Topic {
    pub fn new(
        theme: impl Into<String>,
        degree: AcademicDegree,
        discipline: impl Into<String>,
    ) -> Self {
        Self {
            theme: theme.into(),
            degree,
            discipline: discipline.into(),
        }
    }
}

/// Course-level metadata substituted into the output template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CurriculumMetadata {
    pub subject_title: String,
    #[serde(default)]
    pub profession: String,
    #[serde(default)]
    pub total_hours: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub faculty: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semester: Option<String>,
}

/// A literature reference known to exist in the backing corpus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCandidate {
    /// Corpus identifier.
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub authors: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
}

impl SourceCandidate {
    pub fn new(id: impl Into<String>, title: impl Into<String>, authors: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            authors: authors.into(),
            year: None,
            publisher: None,
        }
    }
}
