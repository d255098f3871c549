use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeMode {
    /// The nth emission pairs with the nth emission of every other ZIP edge into the same target.
    Zip,
    /// Latest value wins; gates the target until every such edge has fired once.
    CombineLatest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub from: String,
    pub to: String,
    pub from_property: String,
    pub to_property: String,
    pub mode: EdgeMode,
}

impl Edge {
    pub fn new(
        id: impl Into<String>,
        from: impl Into<String>,
        from_property: impl Into<String>,
        to: impl Into<String>,
        to_property: impl Into<String>,
        mode: EdgeMode,
    ) -> Self {
        Self {
            id: id.into(),
            from: from.into(),
            to: to.into(),
            from_property: from_property.into(),
            to_property: to_property.into(),
            mode,
        }
    }

    pub fn zip(
        id: impl Into<String>,
        from: impl Into<String>,
        from_property: impl Into<String>,
        to: impl Into<String>,
        to_property: impl Into<String>,
    ) -> Self {
        Self::new(id, from, from_property, to, to_property, EdgeMode::Zip)
    }

    pub fn combine_latest(
        id: impl Into<String>,
        from: impl Into<String>,
        from_property: impl Into<String>,
        to: impl Into<String>,
        to_property: impl Into<String>,
    ) -> Self {
        Self::new(id, from, from_property, to, to_property, EdgeMode::CombineLatest)
    }
}
