use crate::buffer::RdfSource;
use crate::error::TemplateError;
use crate::events::{RDF_REST, RdfEvent, TriplePattern, VarOrTerm};
use crate::pattern_store::TriplePatternStore;
use crate::service::{BindingRow, QueryService};
use crate::sparql_producer::SparqlProducer;
use crate::sparql_writer::SparqlWriter;
use oxigraph::model::{GraphName, NamedNode, Term, Triple};
use std::collections::{HashSet, VecDeque};

/// Triples seen more recently than this many triples ago are suppressed.
pub const DEDUP_WINDOW: usize = 10_240;

/// Converts a (triple, graph) result sequence into an RDF event stream,
/// tracking the active named-graph context and restoring the prefixes
/// supplied by the query.
pub struct GraphResultReader {
    events: VecDeque<RdfEvent>,
}

impl GraphResultReader {
    pub fn new(results: Vec<(Triple, GraphName)>, namespaces: &[(String, String)]) -> Self {
        let mut events = VecDeque::new();
        for (prefix, uri) in namespaces {
            events.push_back(RdfEvent::Namespace {
                prefix: prefix.clone(),
                uri: uri.clone(),
            });
        }
        let mut current_graph: Option<VarOrTerm> = None;
        for (triple, graph) in results {
            let context = match &graph {
                GraphName::DefaultGraph => None,
                GraphName::NamedNode(n) => Some(VarOrTerm::Iri(n.clone())),
                GraphName::BlankNode(b) => Some(VarOrTerm::Blank(b.clone())),
            };
            if context != current_graph {
                if let Some(open) = current_graph.take() {
                    events.push_back(RdfEvent::EndGraph(open));
                }
                if let Some(next) = &context {
                    events.push_back(RdfEvent::StartGraph(next.clone()));
                }
                current_graph = context;
            }
            events.push_back(RdfEvent::Triple(TriplePattern::new(
                VarOrTerm::from_term(&Term::from(triple.subject.clone())),
                VarOrTerm::Iri(triple.predicate.clone()),
                VarOrTerm::from_term(&triple.object),
            )));
        }
        if let Some(open) = current_graph.take() {
            events.push_back(RdfEvent::EndGraph(open));
        }
        Self { events }
    }
}

impl RdfSource for GraphResultReader {
    fn next(&mut self) -> Result<Option<RdfEvent>, TemplateError> {
        Ok(self.events.pop_front())
    }

    fn close(&mut self) -> Result<(), TemplateError> {
        self.events.clear();
        Ok(())
    }
}

/// Suppresses repeated triples within a bounded window, insertion-order
/// evicted. Non-triple events pass through unchanged.
pub struct ReducedTripleReader<S: RdfSource> {
    inner: S,
    capacity: usize,
    seen: HashSet<TriplePattern>,
    order: VecDeque<TriplePattern>,
}

impl<S: RdfSource> ReducedTripleReader<S> {
    pub fn new(inner: S) -> Self {
        Self::with_capacity(inner, DEDUP_WINDOW)
    }

    pub fn with_capacity(inner: S, capacity: usize) -> Self {
        Self {
            inner,
            capacity,
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }
}

impl<S: RdfSource> RdfSource for ReducedTripleReader<S> {
    fn next(&mut self) -> Result<Option<RdfEvent>, TemplateError> {
        loop {
            let Some(event) = self.inner.next()? else {
                return Ok(None);
            };
            if let RdfEvent::Triple(triple) = &event {
                if self.seen.contains(triple) {
                    continue;
                }
                self.seen.insert(triple.clone());
                self.order.push_back(triple.clone());
                if self.order.len() > self.capacity {
                    if let Some(evicted) = self.order.pop_front() {
                        self.seen.remove(&evicted);
                    }
                }
            }
            return Ok(Some(event));
        }
    }

    fn close(&mut self) -> Result<(), TemplateError> {
        self.inner.close()
    }
}

/// Replays a compiled template against the query service as one RDF
/// event stream.
///
/// Each well-joined sub-query is evaluated and drained in turn. Whenever
/// a returned triple continues an `rdf:rest` chain recorded by the
/// store, it is queued; once the live result is exhausted, the queue is
/// drained by re-querying with the list-subject variable bound to the
/// queued node, unrolling collections depth-first with no depth limit.
pub struct RdfStoreReader<'a, Q: QueryService> {
    service: &'a Q,
    store: &'a TriplePatternStore,
    root_binding: Vec<(String, Term)>,
    pending_queries: VecDeque<String>,
    queued_lists: VecDeque<(String, Term)>,
    rest_subjects: Vec<String>,
    current: Option<GraphResultReader>,
    seen_prefixes: HashSet<String>,
    started: bool,
    finished: bool,
}

impl<'a, Q: QueryService> RdfStoreReader<'a, Q> {
    pub fn new(
        store: &'a TriplePatternStore,
        service: &'a Q,
        subject: Option<&NamedNode>,
    ) -> Result<Self, TemplateError> {
        let mut pending_queries = VecDeque::new();
        for source in store.open_well_joined_queries() {
            let mut producer = SparqlProducer::new(source);
            pending_queries.push_back(SparqlWriter::write(&mut producer)?);
        }
        // Bind the root of the template to the requested subject: the
        // owning end of the first pattern, honouring its inverse flag.
        let mut root_binding = Vec::new();
        if let (Some(subject), Some(first)) = (subject, store.first_pattern()) {
            if let Some(name) = first.about().var_name() {
                root_binding.push((name.to_string(), Term::from(subject.clone())));
            }
        }
        let rest_subjects = store
            .patterns()
            .iter()
            .filter(|p| p.predicate.iri_str() == Some(RDF_REST))
            .filter_map(|p| p.subject.var_name().map(str::to_string))
            .collect();
        Ok(Self {
            service,
            store,
            root_binding,
            pending_queries,
            queued_lists: VecDeque::new(),
            rest_subjects,
            current: None,
            seen_prefixes: HashSet::new(),
            started: false,
            finished: false,
        })
    }

    fn advance(&mut self) -> Result<bool, TemplateError> {
        if let Some((variable, node)) = self.queued_lists.pop_front() {
            let Some(source) = self
                .store
                .open_query_by_subject(&VarOrTerm::Var(variable.clone()))
            else {
                return Ok(true);
            };
            let mut producer = SparqlProducer::new(source);
            let sparql = SparqlWriter::write(&mut producer)?;
            let results = self.service.graph_query(&sparql, &[(variable, node)])?;
            let namespaces = self.service.namespaces()?;
            self.current = Some(GraphResultReader::new(results, &namespaces));
            return Ok(true);
        }
        if let Some(sparql) = self.pending_queries.pop_front() {
            let results = self.service.graph_query(&sparql, &self.root_binding)?;
            let namespaces = self.service.namespaces()?;
            self.current = Some(GraphResultReader::new(results, &namespaces));
            return Ok(true);
        }
        Ok(false)
    }
}

impl<Q: QueryService> RdfSource for RdfStoreReader<'_, Q> {
    fn next(&mut self) -> Result<Option<RdfEvent>, TemplateError> {
        if !self.started {
            self.started = true;
            return Ok(Some(RdfEvent::StartDocument));
        }
        loop {
            if let Some(reader) = &mut self.current {
                match reader.next()? {
                    Some(RdfEvent::Namespace { prefix, uri }) => {
                        if self.seen_prefixes.insert(prefix.clone()) {
                            return Ok(Some(RdfEvent::Namespace { prefix, uri }));
                        }
                        continue;
                    }
                    Some(event) => {
                        if let RdfEvent::Triple(triple) = &event {
                            if triple.predicate.iri_str() == Some(RDF_REST) {
                                if let Some(term) = triple.object.as_term() {
                                    for variable in &self.rest_subjects {
                                        self.queued_lists.push_back((variable.clone(), term.clone()));
                                    }
                                }
                            }
                        }
                        return Ok(Some(event));
                    }
                    None => {
                        self.current = None;
                    }
                }
            }
            if self.finished {
                return Ok(None);
            }
            if !self.advance()? {
                self.finished = true;
                return Ok(Some(RdfEvent::EndDocument));
            }
        }
    }

    fn close(&mut self) -> Result<(), TemplateError> {
        self.pending_queries.clear();
        self.queued_lists.clear();
        if let Some(mut reader) = self.current.take() {
            reader.close()?;
        }
        self.finished = true;
        Ok(())
    }
}

/// Executes a compiled SELECT query and yields its rows in order.
pub struct SparqlResultReader {
    rows: VecDeque<BindingRow>,
}

impl SparqlResultReader {
    pub fn new(
        service: &impl QueryService,
        sparql: &str,
        bindings: &[(String, Term)],
    ) -> Result<Self, TemplateError> {
        Ok(Self {
            rows: service.tuple_query(sparql, bindings)?.into(),
        })
    }

    pub fn next_row(&mut self) -> Option<BindingRow> {
        self.rows.pop_front()
    }

    pub fn into_rows(self) -> Vec<BindingRow> {
        self.rows.into()
    }
}
