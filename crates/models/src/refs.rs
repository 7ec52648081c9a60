use crate::Id;

/// Ref is a persisted pointer between entities. It exposes the target's
/// id and a cached label without loading the target; resolution goes
/// through the persistence cache at a higher layer. Inter-entity edges
/// are ids rather than pointers, so entity graphs cannot form memory
/// cycles even when references do.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Ref {
    pub id: Id,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Ref {
    pub fn new(id: Id) -> Self {
        Self { id, label: None }
    }

    pub fn with_label(id: Id, label: impl Into<String>) -> Self {
        Self {
            id,
            label: Some(label.into()),
        }
    }

    /// Update the stub's label so the reference can print without
    /// loading its target. The target's own label is not written through.
    pub fn set_label(&mut self, label: impl Into<String>) {
        self.label = Some(label.into());
    }
}

impl std::fmt::Display for Ref {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.label {
            Some(label) => write!(f, "{} ({})", self.id, label),
            None => write!(f, "{}", self.id),
        }
    }
}
