use crate::buffer::{BufferedXmlReader, VecSource};
use crate::error::TemplateError;
use crate::events::TermFactory;
use crate::graph_pattern::GraphPatternReader;
use crate::pattern_store::TriplePatternStore;
use crate::rdfa_producer::RdfaProducer;
use crate::rdfa_reader::{RdfaReader, TemplateModel};
use crate::result_reader::{RdfStoreReader, ReducedTripleReader, SparqlResultReader};
use crate::service::QueryService;
use crate::sparql_producer::SparqlProducer;
use crate::sparql_writer::SparqlWriter;
use crate::xml_source::TemplateSource;
use crate::xml_writer::XmlWriter;
use oxigraph::model::{NamedNode, Term};
use std::collections::HashMap;

/// A compiled template: parse once, then derive queries, evaluate
/// against a query service, or render result rows back into markup.
pub struct TemplateEngine {
    template: String,
    model: TemplateModel,
    store: TriplePatternStore,
}

impl TemplateEngine {
    /// Compiles template markup, resolving references against `base`.
    pub fn compile(template: &str, base: Option<&str>) -> Result<Self, TemplateError> {
        let mut factory = TermFactory::new();
        let mut xml = BufferedXmlReader::new(TemplateSource::from_str(template));
        let model = RdfaReader::read(&mut xml, &mut factory, base)?;

        #[cfg(debug_assertions)]
        println!(
            "[TemplateEngine] Compiled template: {} events, {} variables",
            model.events.len(),
            model.origins.len()
        );

        let mut store = TriplePatternStore::new();
        let mut patterns =
            GraphPatternReader::new(VecSource::new(model.events.clone()), &mut factory);
        store.consume(&mut patterns)?;
        Ok(Self {
            template: template.to_string(),
            model,
            store,
        })
    }

    /// The CONSTRUCT query equivalent to the whole template.
    pub fn construct_query(&self) -> Result<String, TemplateError> {
        let mut producer = SparqlProducer::new(self.store.open_query());
        SparqlWriter::write(&mut producer)
    }

    /// The SELECT query whose ordered rows drive rendering.
    pub fn select_query(&self) -> Result<String, TemplateError> {
        let mut producer = SparqlProducer::new(self.store.open_select_query());
        SparqlWriter::write(&mut producer)
    }

    /// Named template variables in first-seen order.
    pub fn variables(&self) -> Vec<String> {
        self.store.variables()
    }

    /// Variable name to the path of the element that introduced it.
    pub fn origins(&self) -> &HashMap<String, String> {
        &self.model.origins
    }

    pub fn pattern_store(&self) -> &TriplePatternStore {
        &self.store
    }

    /// Replays the template against the service as a deduplicated RDF
    /// event stream, optionally scoped to one root subject.
    pub fn evaluate<'a, Q: QueryService>(
        &'a self,
        service: &'a Q,
        subject: Option<&NamedNode>,
    ) -> Result<ReducedTripleReader<RdfStoreReader<'a, Q>>, TemplateError> {
        Ok(ReducedTripleReader::new(RdfStoreReader::new(
            &self.store,
            service,
            subject,
        )?))
    }

    /// Runs the SELECT query and binds its rows back into the template,
    /// returning the rendered markup.
    pub fn render(
        &self,
        service: &impl QueryService,
        subject: Option<&NamedNode>,
    ) -> Result<String, TemplateError> {
        let sparql = self.select_query()?;
        let mut bindings = Vec::new();
        if let (Some(subject), Some(first)) = (subject, self.store.first_pattern()) {
            if let Some(name) = first.about().var_name() {
                bindings.push((name.to_string(), Term::from(subject.clone())));
            }
        }
        let rows = SparqlResultReader::new(service, &sparql, &bindings)?.into_rows();

        #[cfg(debug_assertions)]
        println!("[TemplateEngine] Rendering {} result rows", rows.len());

        let xml = BufferedXmlReader::new(TemplateSource::from_str(&self.template));
        let mut producer =
            RdfaProducer::new(xml, rows, &self.model.origins, service.namespaces()?);
        let mut writer = XmlWriter::new();
        while let Some(event) = producer.next()? {
            writer.event(&event);
        }
        Ok(writer.finish())
    }
}
