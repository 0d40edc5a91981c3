mod buffer;
mod engine;
mod error;
mod events;
mod graph_pattern;
mod pattern_store;
mod rdfa_producer;
mod rdfa_reader;
mod result_reader;
mod service;
mod sparql_producer;
mod sparql_writer;
mod xml_source;
mod xml_writer;

pub use buffer::{BufferedRdfReader, BufferedXmlReader, RdfSource, VecSource, XmlSource};
pub use engine::TemplateEngine;
pub use error::TemplateError;
pub use events::{
    Attribute, Element, RDF_FIRST, RDF_NIL, RDF_REST, RDF_TYPE, RdfEvent, TermFactory,
    TriplePattern, VarOrTerm, XmlEvent,
};
pub use graph_pattern::GraphPatternReader;
pub use pattern_store::TriplePatternStore;
pub use rdfa_producer::RdfaProducer;
pub use rdfa_reader::{RdfaReader, TemplateModel};
pub use result_reader::{GraphResultReader, RdfStoreReader, ReducedTripleReader, SparqlResultReader};
pub use service::{BindingRow, QueryService, StoreService};
pub use sparql_producer::SparqlProducer;
pub use sparql_writer::SparqlWriter;
pub use xml_source::TemplateSource;
pub use xml_writer::XmlWriter;
