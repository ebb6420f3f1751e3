use crate::event::SequencedEvent;
use std::collections::HashSet;

/// One disjunct of a [`Query`].
///
/// `event_types` is a disjunction (empty means "any type"); `tags` is a
/// conjunction (every listed tag must be present). A `QueryItem` with
/// both sets empty is vacuous and matches nothing; `Query::all()` is
/// the only universal matcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryItem {
    pub event_types: HashSet<String>,
    pub tags: HashSet<(String, String)>,
}

impl QueryItem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_types(mut self, types: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.event_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tags(
        mut self,
        tags: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Self {
        self.tags = tags
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }

    fn matches(&self, event: &SequencedEvent) -> bool {
        if self.event_types.is_empty() && self.tags.is_empty() {
            return false;
        }

        let type_ok = self.event_types.is_empty() || self.event_types.contains(event.event_type());

        let tags_ok = self.tags.iter().all(|(k, v)| event.has_tag(k, v));

        type_ok && tags_ok
    }
}

/// A disjunction of [`QueryItem`]s. An empty `Query` (see
/// [`Query::all`]) matches every event; this is distinct from a query
/// containing one vacuous item, which matches nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    items: Vec<QueryItem>,
}

impl Query {
    /// The universal query: matches every event.
    pub fn all() -> Self {
        Self { items: Vec::new() }
    }

    pub fn from_items(items: Vec<QueryItem>) -> Self {
        Self { items }
    }

    pub fn is_all(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[QueryItem] {
        &self.items
    }

    /// In-memory predicate mirroring the on-disk resolver used by
    /// `EventStore::read`. Must agree with it on every event —
    /// exercised by the DCB composition in `EventStore::append` and by
    /// the projection manager's event filtering.
    pub fn matches(&self, event: &SequencedEvent) -> bool {
        if self.is_all() {
            return true;
        }
        self.items.iter().any(|item| item.matches(event))
    }
}
