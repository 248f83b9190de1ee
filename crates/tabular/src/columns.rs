use std::collections::HashMap;

/// Case-insensitive mapping from column name to zero-based ordinal.
///
/// Names keep their original spelling for display. When a name appears twice
/// the first ordinal wins, as with duplicate labels in a query result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnIndex {
    names: Vec<String>,
    ordinals: HashMap<String, usize>,
}

impl ColumnIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut index = Self::new();
        for name in names {
            index.push(name);
        }
        index
    }

    /// Appends a column and returns its ordinal.
    pub fn push(&mut self, name: impl Into<String>) -> usize {
        let name = name.into();
        let ordinal = self.names.len();
        self.ordinals.entry(name.to_lowercase()).or_insert(ordinal);
        self.names.push(name);
        ordinal
    }

    pub fn get(&self, name: &str) -> Option<usize> {
        self.ordinals.get(&name.to_lowercase()).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Column names in ordinal order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn clear(&mut self) {
        self.names.clear();
        self.ordinals.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_ignores_case() {
        let index = ColumnIndex::from_names(["Feature_ID", "valid_time"]);
        assert_eq!(index.get("feature_id"), Some(0));
        assert_eq!(index.get("VALID_TIME"), Some(1));
        assert_eq!(index.get("missing"), None);
        assert_eq!(index.names(), ["Feature_ID", "valid_time"]);
    }

    #[test]
    fn first_duplicate_wins() {
        let index = ColumnIndex::from_names(["a", "A"]);
        assert_eq!(index.len(), 2);
        assert_eq!(index.get("a"), Some(0));
    }
}
