use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A canonical attribute: either a value found upstream or an explicit "unspecified".
///
/// Serialized as the plain string, or as `"unspecified"`; never omitted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Field {
    Value(String),
    #[default]
    Unspecified,
}

impl Field {
    pub const UNSPECIFIED: &'static str = "unspecified";

    /// Blank strings count as absent.
    pub fn from_opt<S: AsRef<str>>(v: Option<S>) -> Self {
        match v {
            Some(s) if !s.as_ref().trim().is_empty() => Self::Value(s.as_ref().trim().to_string()),
            _ => Self::Unspecified,
        }
    }

    pub fn value(v: impl AsRef<str>) -> Self {
        Self::from_opt(Some(v))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Value(s) => Some(s.as_str()),
            Self::Unspecified => None,
        }
    }

    pub fn is_specified(&self) -> bool {
        matches!(self, Self::Value(_))
    }

    pub fn or(self, other: Field) -> Field {
        if self.is_specified() {
            self
        } else {
            other
        }
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str().unwrap_or(Self::UNSPECIFIED))
    }
}

impl Serialize for Field {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str().unwrap_or(Self::UNSPECIFIED))
    }
}

impl<'de> Deserialize<'de> for Field {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = Option::<String>::deserialize(d)?;
        Ok(match s {
            Some(s) if s == Self::UNSPECIFIED => Self::Unspecified,
            other => Self::from_opt(other),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalSearchResult {
    pub id: String,
    pub title: Field,
    pub summary: Field,
    pub component: Field,
    pub priority: Field,
    pub category: Field,
    /// `YYYY-MM-DD` (UTC).
    pub release_date: Field,
    pub language: Field,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalNote {
    pub id: String,
    pub title: Field,
    pub summary: Field,
    pub component: Field,
    pub priority: Field,
    pub category: Field,
    pub release_date: Field,
    pub language: Field,
    pub url: String,
    pub content: Field,
}

impl CanonicalNote {
    /// A note that only knows its identity; every attribute is unspecified.
    pub fn bare(id: &str, url: &str) -> Self {
        Self {
            id: id.to_string(),
            title: Field::Unspecified,
            summary: Field::Unspecified,
            component: Field::Unspecified,
            priority: Field::Unspecified,
            category: Field::Unspecified,
            release_date: Field::Unspecified,
            language: Field::Unspecified,
            url: url.to_string(),
            content: Field::Unspecified,
        }
    }

    /// A note with neither title nor content carries nothing worth returning.
    pub fn has_substance(&self) -> bool {
        self.title.is_specified() || self.content.is_specified()
    }
}
