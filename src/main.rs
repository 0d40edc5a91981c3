use oxigraph::model::{GraphName, NamedNode, Quad};
use rdfa_sparql::{StoreService, TemplateEngine};

fn main() {
    let mut service = StoreService::new().expect("in-memory store");
    service.add_namespace("foaf", "http://xmlns.com/foaf/0.1/");

    // Sample data
    let people = [
        ("http://example.org/ann", "Ann"),
        ("http://example.org/bob", "Bob"),
    ];
    for (iri, name) in people {
        service
            .insert(&Quad::new(
                NamedNode::new(iri).unwrap(),
                NamedNode::new("http://xmlns.com/foaf/0.1/name").unwrap(),
                oxigraph::model::Literal::new_simple_literal(name),
                GraphName::DefaultGraph,
            ))
            .unwrap();
    }

    let template = r#"<ul xmlns:foaf="http://xmlns.com/foaf/0.1/">
  <li about="?person"><span property="foaf:name">{?name}</span></li>
</ul>"#;

    let engine = TemplateEngine::compile(template, None).expect("template compiles");

    println!("Derived query:\n{}", engine.construct_query().unwrap());
    println!("Rendered page:\n{}", engine.render(&service, None).unwrap());
}
