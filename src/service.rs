use crate::error::TemplateError;
use oxigraph::model::{GraphName, Quad, Term, Triple};
use oxigraph::sparql::{QueryResults, SparqlEvaluator};
use oxigraph::store::Store;
use std::collections::HashMap;

/// One solution row: variable name to bound term.
pub type BindingRow = HashMap<String, Term>;

/// The external query-execution contract consumed by the pipeline. The
/// pipeline never mutates the backing store and issues at most one
/// evaluation at a time.
pub trait QueryService {
    /// Evaluates a CONSTRUCT query, with the given variables pre-bound.
    fn graph_query(
        &self,
        sparql: &str,
        bindings: &[(String, Term)],
    ) -> Result<Vec<(Triple, GraphName)>, TemplateError>;

    /// Evaluates a SELECT query, with the given variables pre-bound.
    fn tuple_query(
        &self,
        sparql: &str,
        bindings: &[(String, Term)],
    ) -> Result<Vec<BindingRow>, TemplateError>;

    /// Known prefix table of the backing store.
    fn namespaces(&self) -> Result<Vec<(String, String)>, TemplateError>;
}

/// Query service over an in-memory oxigraph store.
pub struct StoreService {
    store: Store,
    namespaces: Vec<(String, String)>,
}

impl StoreService {
    pub fn new() -> Result<Self, TemplateError> {
        Ok(Self {
            store: Store::new().map_err(TemplateError::evaluation)?,
            namespaces: Vec::new(),
        })
    }

    pub fn insert(&self, quad: &Quad) -> Result<(), TemplateError> {
        self.store
            .insert(quad)
            .map(|_| ())
            .map_err(TemplateError::evaluation)
    }

    pub fn add_namespace(&mut self, prefix: &str, uri: &str) {
        self.namespaces.push((prefix.to_string(), uri.to_string()));
    }

    fn execute(
        &self,
        sparql: &str,
        bindings: &[(String, Term)],
    ) -> Result<QueryResults<'_>, TemplateError> {
        let sparql = bind(sparql, bindings);

        #[cfg(debug_assertions)]
        {
            println!("[StoreService] Executing query:");
            println!("{}", sparql);
        }

        SparqlEvaluator::new()
            .parse_query(&sparql)
            .map_err(TemplateError::evaluation)?
            .on_store(&self.store)
            .execute()
            .map_err(TemplateError::evaluation)
    }
}

impl QueryService for StoreService {
    fn graph_query(
        &self,
        sparql: &str,
        bindings: &[(String, Term)],
    ) -> Result<Vec<(Triple, GraphName)>, TemplateError> {
        let results = self.execute(sparql, bindings)?;
        let QueryResults::Graph(triples) = results else {
            return Err(TemplateError::evaluation("expected a graph result"));
        };
        let mut out = Vec::new();
        for triple in triples {
            let triple = triple.map_err(TemplateError::evaluation)?;
            out.push((triple, GraphName::DefaultGraph));
        }
        Ok(out)
    }

    fn tuple_query(
        &self,
        sparql: &str,
        bindings: &[(String, Term)],
    ) -> Result<Vec<BindingRow>, TemplateError> {
        let results = self.execute(sparql, bindings)?;
        let QueryResults::Solutions(solutions) = results else {
            return Err(TemplateError::evaluation("expected a tuple result"));
        };
        let mut rows = Vec::new();
        for solution in solutions {
            let solution = solution.map_err(TemplateError::evaluation)?;
            let mut row = BindingRow::new();
            for (variable, term) in solution.iter() {
                row.insert(variable.as_str().to_string(), term.clone());
            }
            rows.push(row);
        }
        Ok(rows)
    }

    fn namespaces(&self) -> Result<Vec<(String, String)>, TemplateError> {
        Ok(self.namespaces.clone())
    }
}

/// Pre-binds variables by injecting a VALUES row into the last group of
/// the query.
fn bind(sparql: &str, bindings: &[(String, Term)]) -> String {
    if bindings.is_empty() {
        return sparql.to_string();
    }
    let mut values = String::new();
    for (name, term) in bindings {
        values.push_str(&format!("VALUES ?{name} {{ {term} }}\n"));
    }
    match sparql.rfind('}') {
        Some(idx) => format!("{}{}{}", &sparql[..idx], values, &sparql[idx..]),
        None => sparql.to_string(),
    }
}
