use std::sync::Arc;

use casgraph_core::{
    deserialize_xmi, deserialize_xmi_with, serialize_xmi, Cas, CasConfig, CasError, FeatureValue,
    FsRef, SerializationError, XmiOptions, ANNOTATION_INDEX,
};
use casgraph_types::builtin;
use casgraph_types::{TypeSystem, TypeSystemBuilder};

fn ts() -> Arc<TypeSystem> {
    let mut b = TypeSystemBuilder::new();
    b.declare_string_subtype("org.example.Pos", &["NOUN", "VERB"])
        .unwrap();
    b.declare_type("org.example.Token", builtin::ANNOTATION)
        .unwrap();
    b.declare_feature("org.example.Token", "pos", "org.example.Pos", false)
        .unwrap();
    b.declare_feature("org.example.Token", "next", "org.example.Token", false)
        .unwrap();
    b.declare_feature("org.example.Token", "score", builtin::DOUBLE, false)
        .unwrap();
    b.declare_type("other.text.Token", builtin::TOP).unwrap();
    b.declare_feature("other.text.Token", "lemma", builtin::STRING, false)
        .unwrap();
    b.declare_type("Bare", builtin::TOP).unwrap();
    b.declare_feature("Bare", "tokens", "org.example.Token[]", false)
        .unwrap();
    b.declare_feature("Bare", "names", builtin::STRING_ARRAY, false)
        .unwrap();
    b.declare_feature("Bare", "counts", builtin::INTEGER_ARRAY, false)
        .unwrap();
    b.declare_feature("Bare", "flag", builtin::BOOLEAN, false)
        .unwrap();
    b.commit().unwrap()
}

fn sample(ts: Arc<TypeSystem>, config: CasConfig) -> Cas {
    let mut cas = Cas::with_config(ts, config).unwrap();
    let view = cas.initial_view();
    cas.set_document_text(view, "Tom & \"Jerry\" <ran>\n\tfast").unwrap();
    let token_ty = cas.type_system().get_type("org.example.Token").unwrap();
    let clash_ty = cas.type_system().get_type("other.text.Token").unwrap();
    let bare_ty = cas.type_system().get_type("Bare").unwrap();

    let first = cas.create_annotation(view, token_ty, 0, 3).unwrap();
    let second = cas.create_annotation(view, token_ty, 14, 17).unwrap();
    let pos = cas.feature_by_name(first, "pos").unwrap();
    let next = cas.feature_by_name(first, "next").unwrap();
    let score = cas.feature_by_name(first, "score").unwrap();
    cas.set_string(first, pos, Some("NOUN")).unwrap();
    cas.set_ref(first, next, Some(second)).unwrap();
    cas.set_double(first, score, 0.1).unwrap();
    cas.set_double(second, score, -1e300).unwrap();
    cas.add_to_index(view, second).unwrap();
    cas.add_to_index(view, first).unwrap();

    let clash = cas.create(view, clash_ty).unwrap();
    let lemma = cas.feature_by_name(clash, "lemma").unwrap();
    cas.set_string(clash, lemma, Some("")).unwrap();
    cas.add_to_index(view, clash).unwrap();

    let bare = cas.create(view, bare_ty).unwrap();
    let tokens_ty = cas.type_system().array_type_for(token_ty).unwrap();
    let tokens = cas.create_array(view, tokens_ty, 3).unwrap();
    cas.set_array_element(tokens, 1, first.into()).unwrap();
    cas.set_array_element(tokens, 2, second.into()).unwrap();
    let names_ty = cas.type_system().get_type(builtin::STRING_ARRAY).unwrap();
    let names = cas.create_array(view, names_ty, 3).unwrap();
    cas.set_array_element(names, 0, " padded <b> ".into()).unwrap();
    cas.set_array_element(names, 2, "two\nlines".into()).unwrap();
    let counts_ty = cas.type_system().get_type(builtin::INTEGER_ARRAY).unwrap();
    let counts = cas.create_array(view, counts_ty, 2).unwrap();
    cas.set_array_element(counts, 0, FeatureValue::Int(-5)).unwrap();
    cas.set_array_element(counts, 1, FeatureValue::Int(i32::MAX))
        .unwrap();
    let empty = cas.create_array(view, counts_ty, 0).unwrap();
    for (feature, value) in [
        ("tokens", FeatureValue::Ref(Some(tokens))),
        ("names", FeatureValue::Ref(Some(names))),
        ("counts", FeatureValue::Ref(Some(counts))),
        ("flag", FeatureValue::Boolean(true)),
    ] {
        let f = cas.feature_by_name(bare, feature).unwrap();
        cas.set_feature_value(bare, f, value).unwrap();
    }
    cas.add_to_index(view, bare).unwrap();
    cas.add_to_index(view, empty).unwrap();

    let other = cas.create_view("translation").unwrap();
    cas.set_document_text(other, "Tom & Jerry").unwrap();
    let t = cas.create_annotation(other, token_ty, 0, 3).unwrap();
    cas.add_to_index(other, t).unwrap();
    cas.add_to_index(other, bare).unwrap();
    cas
}

fn describe(cas: &Cas) -> Vec<String> {
    let ts = cas.type_system();
    let mut out = Vec::new();
    for fs in cas.all_fs() {
        let ty = cas.type_of(fs).unwrap();
        let info = ts.type_info(ty);
        let values: Vec<FeatureValue> = if info.is_array() {
            cas.array_elements(fs).unwrap()
        } else {
            ts.features_of(ty)
                .iter()
                .map(|f| cas.get_feature_value(fs, *f).unwrap())
                .collect()
        };
        out.push(format!("{fs} {} {values:?}", info.name()));
    }
    for view in cas.views() {
        let annotations: Vec<FsRef> = cas.annotation_index(view).unwrap().collect();
        out.push(format!(
            "view {} {:?} {:?} {annotations:?}",
            cas.view_name(view).unwrap(),
            cas.document_text(view).unwrap(),
            cas.all_indexed(view).unwrap()
        ));
    }
    out
}

#[test]
fn round_trip_preserves_everything() {
    let ts = ts();
    let cas = sample(Arc::clone(&ts), CasConfig::default());
    let xml = serialize_xmi(&cas).unwrap();
    assert!(xml.starts_with("<?xml"));
    assert!(xml.contains("xmlns:example=\"http:///org/example.ecore\""));
    assert!(xml.contains("xmlns:text=\"http:///other/text.ecore\""));
    assert!(xml.contains("xmlns:noNamespace=\"http:///uima/noNamespace.ecore\""));
    assert!(xml.contains("elementType=\"org.example.Token\""));

    let load = deserialize_xmi(&xml, ts, &XmiOptions::default()).unwrap();
    assert!(load.diagnostics.is_empty());
    assert_eq!(describe(&load.cas), describe(&cas));
    // Same ids, same output.
    assert_eq!(serialize_xmi(&load.cas).unwrap(), xml);
}

#[test]
fn compact_output_has_no_indentation() {
    let ts = ts();
    let mut config = CasConfig::default();
    config.xmi.pretty = false;
    let mut cas = Cas::with_config(Arc::clone(&ts), config).unwrap();
    let view = cas.initial_view();
    cas.set_document_text(view, "plain").unwrap();
    let xml = serialize_xmi(&cas).unwrap();
    assert!(!xml.contains('\n'));
    let load = deserialize_xmi(&xml, ts, &XmiOptions::default()).unwrap();
    assert_eq!(
        load.cas.document_text(load.cas.initial_view()).unwrap(),
        Some("plain")
    );
}

const HAND_WRITTEN: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<xmi:XMI xmlns:xmi="http://www.omg.org/XMI" xmlns:cas="http:///uima/cas.ecore"
         xmlns:ex="http:///org/example.ecore" xmi:version="2.0">
  <cas:NULL xmi:id="0"/>
  <ex:Token xmi:id="12" sofa="10" begin="0" end="3" next="13" pos="NOUN"/>
  <ex:Token xmi:id="13" sofa="10" begin="4" end="7"/>
  <cas:Sofa xmi:id="10" sofaNum="1" sofaID="_InitialView" mimeType="text" sofaString="cat sat"/>
  <cas:View sofa="10" members="13 12"/>
</xmi:XMI>"#;

#[test]
fn forward_references_resolve_and_ids_are_kept() {
    let load = deserialize_xmi(HAND_WRITTEN, ts(), &XmiOptions::default()).unwrap();
    let cas = load.cas;
    let ids: Vec<u32> = cas.all_fs().iter().map(|fs| fs.id()).collect();
    assert_eq!(ids, vec![10, 12, 13]);

    let view = cas.initial_view();
    let tokens: Vec<FsRef> = cas.annotation_index(view).unwrap().collect();
    assert_eq!(tokens.len(), 2);
    assert_eq!(tokens[0].id(), 12);
    let next = cas.feature_by_name(tokens[0], "next").unwrap();
    assert_eq!(cas.get_ref(tokens[0], next).unwrap(), Some(tokens[1]));
    assert_eq!(cas.covered_text(tokens[0]).unwrap(), "cat");
    assert_eq!(cas.covered_text(tokens[1]).unwrap(), "sat");
}

#[test]
fn non_numeric_ids_are_renumbered_in_document_order() {
    let xml = HAND_WRITTEN
        .replace("\"12\"", "\"first\"")
        .replace("\"13\"", "\"second\"")
        .replace("\"10\"", "\"sofa\"")
        .replace("members=\"13 12\"", "members=\"second first\"");
    let load = deserialize_xmi(&xml, ts(), &XmiOptions::default()).unwrap();
    let cas = load.cas;
    let ids: Vec<u32> = cas.all_fs().iter().map(|fs| fs.id()).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    let sofa = cas.view_sofa(cas.initial_view()).unwrap();
    assert_eq!(sofa.id(), 3);
    let first = cas.annotation_index(cas.initial_view()).unwrap().next().unwrap();
    assert_eq!(cas.covered_text(first).unwrap(), "cat");
}

const FLAWED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<xmi:XMI xmlns:xmi="http://www.omg.org/XMI" xmlns:cas="http:///uima/cas.ecore"
         xmlns:ex="http:///org/example.ecore" xmi:version="2.0">
  <cas:NULL xmi:id="0"/>
  <cas:Sofa xmi:id="1" sofaNum="1" sofaID="_InitialView" sofaString="cat sat"/>
  <ex:Token xmi:id="2" sofa="1" begin="0" end="3" colour="red" next="9"/>
  <ex:Mystery xmi:id="3"/>
  <ex:Token xmi:id="4" sofa="1" begin="4" end="7" pos="ADJ"/>
  <cas:View sofa="1" members="2 3 4"/>
</xmi:XMI>"#;

#[test]
fn lenient_load_skips_problems_with_diagnostics() {
    let load = deserialize_xmi(FLAWED, ts(), &XmiOptions::lenient()).unwrap();
    let messages: Vec<&str> = load
        .diagnostics
        .iter()
        .map(|d| d.message.as_str())
        .collect();
    assert_eq!(messages.len(), 5, "{messages:#?}");
    assert!(messages.iter().any(|m| m.contains("org.example.Mystery")));
    assert!(messages.iter().any(|m| m.contains("colour")));
    assert!(messages.iter().any(|m| m.contains("ADJ")));
    assert!(load.diagnostics.iter().all(|d| d.position > 0));

    let cas = load.cas;
    let view = cas.initial_view();
    assert_eq!(cas.index_size(view, ANNOTATION_INDEX).unwrap(), 2);
    let tokens: Vec<FsRef> = cas.annotation_index(view).unwrap().collect();
    let next = cas.feature_by_name(tokens[0], "next").unwrap();
    let pos = cas.feature_by_name(tokens[1], "pos").unwrap();
    assert_eq!(cas.get_ref(tokens[0], next).unwrap(), None);
    assert_eq!(cas.get_string(tokens[1], pos).unwrap(), None);
}

#[test]
fn strict_load_fails_on_first_problem() {
    let err = deserialize_xmi(FLAWED, ts(), &XmiOptions::default()).unwrap_err();
    assert_eq!(
        err,
        CasError::Serialization(SerializationError::UnknownType(
            "org.example.Mystery".to_string()
        ))
    );

    let config = CasConfig {
        xmi: XmiOptions::lenient(),
        ..CasConfig::default()
    };
    assert!(deserialize_xmi_with(FLAWED, ts(), config).is_ok());
}

#[test]
fn documents_that_are_not_xmi_are_rejected() {
    assert!(matches!(
        deserialize_xmi("<root/>", ts(), &XmiOptions::lenient()),
        Err(CasError::Serialization(SerializationError::Malformed(_)))
    ));
    assert!(matches!(
        deserialize_xmi("<xmi:XMI>", ts(), &XmiOptions::lenient()),
        Err(CasError::Serialization(SerializationError::Xml(_)))
    ));
}

#[test]
fn missing_initial_view_is_created() {
    let xml = r#"<xmi:XMI xmlns:xmi="http://www.omg.org/XMI" xmlns:cas="http:///uima/cas.ecore">
  <cas:Sofa xmi:id="1" sofaNum="2" sofaID="other" sofaString="x"/>
</xmi:XMI>"#;
    let cas = deserialize_xmi(xml, ts(), &XmiOptions::default())
        .unwrap()
        .cas;
    assert!(cas.get_view("other").is_ok());
    let initial = cas.initial_view();
    assert_eq!(cas.view_name(initial).unwrap(), "_InitialView");
    assert_eq!(cas.document_text(initial).unwrap(), None);
}
