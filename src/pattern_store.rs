use crate::buffer::{RdfSource, VecSource};
use crate::error::TemplateError;
use crate::events::{RdfEvent, TriplePattern, VAR_NS, VarOrTerm};
use oxigraph::model::NamedNode;
use std::collections::HashMap;

/// Indexes a compiled WHERE clause by subject and by predicate and
/// builds CONSTRUCT+WHERE query readers over it.
///
/// The store is write-once: `consume` runs a single pass over the
/// graph-pattern stream, after which it is read-only.
#[derive(Debug, Default)]
pub struct TriplePatternStore {
    base: Option<String>,
    namespaces: Vec<(String, String)>,
    by_subject: HashMap<VarOrTerm, Vec<RdfEvent>>,
    subject_order: Vec<VarOrTerm>,
    by_predicate: HashMap<VarOrTerm, Vec<TriplePattern>>,
    patterns: Vec<TriplePattern>,
    first_pattern: Option<TriplePattern>,
    where_events: Vec<RdfEvent>,
    project_variables: bool,
}

impl TriplePatternStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that additionally projects template-variable identity
    /// into the CONSTRUCT clause, so result readers can recover which
    /// variable a bound subject corresponds to.
    pub fn with_variable_projection() -> Self {
        Self {
            project_variables: true,
            ..Self::default()
        }
    }

    /// Single consuming pass. Every event seen while a subject is open
    /// is recorded under all currently open subjects.
    pub fn consume(&mut self, source: &mut impl RdfSource) -> Result<(), TemplateError> {
        let mut open: Vec<VarOrTerm> = Vec::new();
        while let Some(event) = source.next()? {
            match &event {
                RdfEvent::StartDocument | RdfEvent::EndDocument => continue,
                RdfEvent::Base(base) => {
                    self.base = Some(base.clone());
                    continue;
                }
                RdfEvent::Namespace { prefix, uri } => {
                    self.namespaces.push((prefix.clone(), uri.clone()));
                    continue;
                }
                RdfEvent::StartSubject(subject) => {
                    if !self.by_subject.contains_key(subject) {
                        self.subject_order.push(subject.clone());
                        self.by_subject.insert(subject.clone(), Vec::new());
                    }
                    open.push(subject.clone());
                }
                RdfEvent::TriplePattern(pattern) => {
                    if self.first_pattern.is_none() {
                        self.first_pattern = Some(pattern.clone());
                    }
                    self.patterns.push(pattern.clone());
                    self.by_predicate
                        .entry(pattern.predicate.clone())
                        .or_default()
                        .push(pattern.clone());
                }
                _ => {}
            }
            for subject in &open {
                if let Some(list) = self.by_subject.get_mut(subject) {
                    list.push(event.clone());
                }
            }
            self.where_events.push(event.clone());
            if let RdfEvent::EndSubject(_) = &event {
                open.pop();
            }
        }
        Ok(())
    }

    pub fn base(&self) -> Option<&str> {
        self.base.as_deref()
    }

    pub fn namespaces(&self) -> &[(String, String)] {
        &self.namespaces
    }

    pub fn first_pattern(&self) -> Option<&TriplePattern> {
        self.first_pattern.as_ref()
    }

    pub fn patterns(&self) -> &[TriplePattern] {
        &self.patterns
    }

    pub fn patterns_by_predicate(&self, predicate: &VarOrTerm) -> &[TriplePattern] {
        self.by_predicate
            .get(predicate)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Named template variables in first-seen pattern order.
    pub fn variables(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for pattern in &self.patterns {
            for term in [&pattern.subject, &pattern.predicate, &pattern.object] {
                if let VarOrTerm::Var(name) = term {
                    if !seen.contains(name) {
                        seen.push(name.clone());
                    }
                }
            }
        }
        seen
    }

    /// Full CONSTRUCT query over the whole template.
    pub fn open_query(&self) -> VecSource {
        VecSource::new(self.query_events(&self.where_events))
    }

    /// SELECT query over the same WHERE clause, ordered by variable so
    /// rows for one solution subtree arrive together.
    pub fn open_select_query(&self) -> VecSource {
        let variables: Vec<VarOrTerm> = self
            .variables()
            .into_iter()
            .map(VarOrTerm::Var)
            .collect();
        let mut events = vec![RdfEvent::StartDocument];
        if let Some(base) = &self.base {
            events.push(RdfEvent::Base(base.clone()));
        }
        for (prefix, uri) in &self.namespaces {
            events.push(RdfEvent::Namespace {
                prefix: prefix.clone(),
                uri: uri.clone(),
            });
        }
        events.push(RdfEvent::Select(variables.clone()));
        events.push(RdfEvent::StartWhere);
        events.extend(self.where_events.iter().cloned());
        events.push(RdfEvent::EndWhere);
        if !variables.is_empty() {
            events.push(RdfEvent::OrderBy(variables));
        }
        events.push(RdfEvent::EndDocument);
        VecSource::new(events)
    }

    /// CONSTRUCT query scoped to one recorded subject, or `None` for an
    /// unknown subject.
    pub fn open_query_by_subject(&self, subject: &VarOrTerm) -> Option<VecSource> {
        let fragment = self.by_subject.get(subject)?;
        Some(VecSource::new(self.query_events(fragment)))
    }

    /// Splits a WHERE clause that begins with top-level OPTIONAL blocks
    /// into independently evaluable queries: each keeps the shared
    /// top-level mandatory events and makes one optional block required.
    /// Without leading top-level optionals the full query is returned.
    pub fn open_well_joined_queries(&self) -> Vec<VecSource> {
        if !matches!(self.where_events.first(), Some(RdfEvent::StartOptional)) {
            return vec![self.open_query()];
        }
        let mut shared = Vec::new();
        let mut blocks: Vec<Vec<RdfEvent>> = Vec::new();
        let mut depth = 0usize;
        let mut current: Option<Vec<RdfEvent>> = None;
        for event in &self.where_events {
            match event {
                RdfEvent::StartOptional if depth == 0 => {
                    depth += 1;
                    current = Some(Vec::new());
                }
                RdfEvent::StartOptional | RdfEvent::StartGroup | RdfEvent::StartSubject(_) => {
                    depth += 1;
                    match &mut current {
                        Some(block) => block.push(event.clone()),
                        None => shared.push(event.clone()),
                    }
                }
                RdfEvent::EndOptional if depth == 1 => {
                    depth -= 1;
                    if let Some(block) = current.take() {
                        blocks.push(block);
                    }
                }
                RdfEvent::EndOptional | RdfEvent::EndGroup | RdfEvent::EndSubject(_) => {
                    depth -= 1;
                    match &mut current {
                        Some(block) => block.push(event.clone()),
                        None => shared.push(event.clone()),
                    }
                }
                other => match &mut current {
                    Some(block) => block.push(other.clone()),
                    None => shared.push(other.clone()),
                },
            }
        }
        if blocks.is_empty() {
            return vec![self.open_query()];
        }
        blocks
            .into_iter()
            .map(|block| {
                let mut fragment = shared.clone();
                fragment.extend(block);
                VecSource::new(self.query_events(&fragment))
            })
            .collect()
    }

    fn query_events(&self, fragment: &[RdfEvent]) -> Vec<RdfEvent> {
        let mut events = vec![RdfEvent::StartDocument];
        if let Some(base) = &self.base {
            events.push(RdfEvent::Base(base.clone()));
        }
        for (prefix, uri) in &self.namespaces {
            events.push(RdfEvent::Namespace {
                prefix: prefix.clone(),
                uri: uri.clone(),
            });
        }
        events.push(RdfEvent::StartConstruct);
        let mut projected: Vec<&str> = Vec::new();
        for event in fragment {
            if let RdfEvent::TriplePattern(pattern) = event {
                events.push(RdfEvent::TriplePattern(pattern.clone()));
                if self.project_variables {
                    if let VarOrTerm::Var(name) = &pattern.subject {
                        if !projected.contains(&name.as_str()) {
                            projected.push(name);
                            events.push(RdfEvent::TriplePattern(self.projection(name)));
                        }
                    }
                }
            }
        }
        events.push(RdfEvent::EndConstruct);
        events.push(RdfEvent::StartWhere);
        events.extend(fragment.iter().cloned());
        events.push(RdfEvent::EndWhere);
        events.push(RdfEvent::EndDocument);
        events
    }

    /// `(<base>, <variables-ns>name, ?name)`: names the variable a bound
    /// subject came from.
    fn projection(&self, name: &str) -> TriplePattern {
        let parent = self
            .base
            .clone()
            .unwrap_or_else(|| "urn:template:this".to_string());
        TriplePattern::new(
            VarOrTerm::Iri(NamedNode::new_unchecked(parent)),
            VarOrTerm::Iri(NamedNode::new_unchecked(format!("{VAR_NS}{name}"))),
            VarOrTerm::Var(name.to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxigraph::model::NamedNode;

    fn var(name: &str) -> VarOrTerm {
        VarOrTerm::Var(name.to_string())
    }

    fn iri(s: &str) -> VarOrTerm {
        VarOrTerm::Iri(NamedNode::new(s).unwrap())
    }

    fn consume(events: Vec<RdfEvent>) -> TriplePatternStore {
        let mut store = TriplePatternStore::new();
        store.consume(&mut VecSource::new(events)).unwrap();
        store
    }

    fn nested_fixture() -> Vec<RdfEvent> {
        vec![
            RdfEvent::StartDocument,
            RdfEvent::Base("http://example.org/page".to_string()),
            RdfEvent::StartSubject(var("a")),
            RdfEvent::TriplePattern(TriplePattern::new(
                var("a"),
                iri("http://example.org/p"),
                var("b"),
            )),
            RdfEvent::StartSubject(var("b")),
            RdfEvent::TriplePattern(TriplePattern::new(
                var("b"),
                iri("http://example.org/q"),
                var("c"),
            )),
            RdfEvent::EndSubject(var("b")),
            RdfEvent::EndSubject(var("a")),
            RdfEvent::EndDocument,
        ]
    }

    #[test]
    fn test_nested_events_recorded_under_all_ancestors() {
        let store = consume(nested_fixture());
        // The inner triple belongs to ?b's subtree and to ?a's.
        let a_list = store.by_subject.get(&var("a")).unwrap();
        let b_list = store.by_subject.get(&var("b")).unwrap();
        assert_eq!(
            a_list
                .iter()
                .filter(|e| matches!(e, RdfEvent::TriplePattern(_)))
                .count(),
            2
        );
        assert_eq!(
            b_list
                .iter()
                .filter(|e| matches!(e, RdfEvent::TriplePattern(_)))
                .count(),
            1
        );
        // Each subject list is bracketed by its own start and end.
        assert_eq!(a_list.first(), Some(&RdfEvent::StartSubject(var("a"))));
        assert_eq!(a_list.last(), Some(&RdfEvent::EndSubject(var("a"))));
        assert_eq!(b_list.first(), Some(&RdfEvent::StartSubject(var("b"))));
        assert_eq!(b_list.last(), Some(&RdfEvent::EndSubject(var("b"))));
    }

    #[test]
    fn test_query_by_subject_scopes_construct() {
        let store = consume(nested_fixture());
        let mut query = store.open_query_by_subject(&var("b")).unwrap();
        let mut construct_patterns = 0;
        let mut in_construct = false;
        while let Some(event) = query.next().unwrap() {
            match event {
                RdfEvent::StartConstruct => in_construct = true,
                RdfEvent::EndConstruct => in_construct = false,
                RdfEvent::TriplePattern(_) if in_construct => construct_patterns += 1,
                _ => {}
            }
        }
        assert_eq!(construct_patterns, 1);
        assert!(store.open_query_by_subject(&var("missing")).is_none());
    }

    #[test]
    fn test_predicate_index() {
        let store = consume(nested_fixture());
        assert_eq!(
            store
                .patterns_by_predicate(&iri("http://example.org/q"))
                .len(),
            1
        );
        assert!(
            store
                .patterns_by_predicate(&iri("http://example.org/nope"))
                .is_empty()
        );
    }

    #[test]
    fn test_well_joined_split_on_leading_optionals() {
        let store = consume(vec![
            RdfEvent::StartOptional,
            RdfEvent::StartSubject(var("a")),
            RdfEvent::TriplePattern(TriplePattern::new(
                var("a"),
                iri("http://example.org/p"),
                iri("http://example.org/o"),
            )),
            RdfEvent::EndSubject(var("a")),
            RdfEvent::EndOptional,
            RdfEvent::StartOptional,
            RdfEvent::StartSubject(var("b")),
            RdfEvent::TriplePattern(TriplePattern::new(
                var("b"),
                iri("http://example.org/p"),
                iri("http://example.org/o"),
            )),
            RdfEvent::EndSubject(var("b")),
            RdfEvent::EndOptional,
        ]);
        let queries = store.open_well_joined_queries();
        assert_eq!(queries.len(), 2);
        // Splitting strips the optional wrapper so each block can be
        // evaluated on its own.
        let mut first = queries.into_iter().next().unwrap();
        let mut saw_optional = false;
        while let Some(event) = first.next().unwrap() {
            if matches!(event, RdfEvent::StartOptional) {
                saw_optional = true;
            }
        }
        assert!(!saw_optional);
    }

    #[test]
    fn test_no_split_without_leading_optional() {
        let store = consume(nested_fixture());
        assert_eq!(store.open_well_joined_queries().len(), 1);
    }

    #[test]
    fn test_select_query_projects_and_orders() {
        let store = consume(nested_fixture());
        let mut query = store.open_select_query();
        let mut select = None;
        let mut order = None;
        while let Some(event) = query.next().unwrap() {
            match event {
                RdfEvent::Select(vars) => select = Some(vars),
                RdfEvent::OrderBy(vars) => order = Some(vars),
                _ => {}
            }
        }
        let expected = vec![var("a"), var("b"), var("c")];
        assert_eq!(select, Some(expected.clone()));
        assert_eq!(order, Some(expected));
    }

    #[test]
    fn test_variable_projection_triples() {
        let mut store = TriplePatternStore::with_variable_projection();
        store.consume(&mut VecSource::new(nested_fixture())).unwrap();
        let mut query = store.open_query();
        let mut projected = Vec::new();
        let mut in_construct = false;
        while let Some(event) = query.next().unwrap() {
            match event {
                RdfEvent::StartConstruct => in_construct = true,
                RdfEvent::EndConstruct => in_construct = false,
                RdfEvent::TriplePattern(p) if in_construct => {
                    if let Some(iri) = p.predicate.iri_str() {
                        if let Some(name) = iri.strip_prefix(VAR_NS) {
                            projected.push(name.to_string());
                        }
                    }
                }
                _ => {}
            }
        }
        assert_eq!(projected, vec!["a".to_string(), "b".to_string()]);
    }
}
