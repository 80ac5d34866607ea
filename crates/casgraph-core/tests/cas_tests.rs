use std::sync::Arc;

use casgraph_core::{
    deserialize_binary_self_describing, serialize_binary_with, BinaryOptions, Cas, CasConfig,
    CasError, FeatureValue, FsRef, IndexSpec, ANNOTATION_INDEX,
};
use casgraph_types::builtin;
use casgraph_types::{
    parse_descriptor, IndexKind, KeyDirection, TypeCode, TypeSystem, TypeSystemBuilder,
};

fn ts() -> Arc<TypeSystem> {
    let mut b = TypeSystemBuilder::new();
    b.declare_string_subtype("org.example.Pos", &["NOUN", "VERB", "DET"])
        .unwrap();
    b.declare_type("org.example.Token", builtin::ANNOTATION).unwrap();
    b.declare_feature("org.example.Token", "pos", "org.example.Pos", false)
        .unwrap();
    b.declare_feature("org.example.Token", "score", builtin::DOUBLE, false)
        .unwrap();
    b.declare_type("org.example.Sentence", builtin::ANNOTATION).unwrap();
    b.declare_feature("org.example.Sentence", "tokens", "org.example.Token[]", false)
        .unwrap();
    b.declare_type("org.example.Entity", builtin::TOP).unwrap();
    b.declare_feature("org.example.Entity", "mention", "org.example.Token", false)
        .unwrap();
    b.declare_feature("org.example.Entity", "count", builtin::LONG, false)
        .unwrap();
    b.commit().unwrap()
}

fn ty(cas: &Cas, name: &str) -> TypeCode {
    cas.type_system().get_type(name).unwrap()
}

fn spans(cas: &Cas, refs: impl IntoIterator<Item = FsRef>) -> Vec<(i32, i32)> {
    refs.into_iter().map(|fs| cas.span(fs).unwrap()).collect()
}

#[test]
fn cat_sat_tokens_iterate_in_text_order() {
    let mut cas = Cas::new(ts()).unwrap();
    let view = cas.initial_view();
    cas.set_document_text(view, "cat sat").unwrap();
    let token = ty(&cas, "org.example.Token");

    let sat = cas.create_annotation(view, token, 4, 7).unwrap();
    let cat = cas.create_annotation(view, token, 0, 3).unwrap();
    cas.add_to_index(view, sat).unwrap();
    cas.add_to_index(view, cat).unwrap();

    let texts: Vec<String> = cas
        .annotation_index(view)
        .unwrap()
        .map(|fs| cas.covered_text(fs).unwrap())
        .collect();
    assert_eq!(texts, vec!["cat", "sat"]);
}

#[test]
fn features_outside_the_closure_are_rejected() {
    let mut cas = Cas::new(ts()).unwrap();
    let view = cas.initial_view();
    let entity = cas.create(view, ty(&cas, "org.example.Entity")).unwrap();
    let pos = cas
        .type_system()
        .feature_by_full_name("org.example.Token:pos")
        .unwrap();
    assert!(matches!(
        cas.set_feature_value(entity, pos, FeatureValue::from("NOUN")),
        Err(CasError::FeatureNotFound { .. })
    ));
    assert!(matches!(
        cas.feature_by_name(entity, "lemma"),
        Err(CasError::FeatureNotFound { .. })
    ));
}

#[test]
fn values_must_conform_to_the_range() {
    let mut cas = Cas::new(ts()).unwrap();
    let view = cas.initial_view();
    let token = cas.create(view, ty(&cas, "org.example.Token")).unwrap();
    let sentence = cas.create(view, ty(&cas, "org.example.Sentence")).unwrap();
    let entity = cas.create(view, ty(&cas, "org.example.Entity")).unwrap();

    let pos = cas.feature_by_name(token, "pos").unwrap();
    cas.set_string(token, pos, Some("VERB")).unwrap();
    assert!(matches!(
        cas.set_string(token, pos, Some("ADJ")),
        Err(CasError::TypeMismatch { .. })
    ));
    assert_eq!(cas.get_string(token, pos).unwrap().as_deref(), Some("VERB"));

    let mention = cas.feature_by_name(entity, "mention").unwrap();
    cas.set_ref(entity, mention, Some(token)).unwrap();
    assert!(matches!(
        cas.set_ref(entity, mention, Some(sentence)),
        Err(CasError::TypeMismatch { .. })
    ));
    assert!(matches!(
        cas.set_feature_value(entity, mention, FeatureValue::Int(3)),
        Err(CasError::TypeMismatch { .. })
    ));

    let count = cas.feature_by_name(entity, "count").unwrap();
    cas.set_long(entity, count, -5).unwrap();
    assert_eq!(cas.get_long(entity, count).unwrap(), -5);
    assert!(matches!(
        cas.get_int(entity, count),
        Err(CasError::TypeMismatch { .. })
    ));
}

#[test]
fn new_structures_have_default_slots() {
    let mut cas = Cas::new(ts()).unwrap();
    let view = cas.initial_view();
    let token = cas.create(view, ty(&cas, "org.example.Token")).unwrap();
    let pos = cas.feature_by_name(token, "pos").unwrap();
    let score = cas.feature_by_name(token, "score").unwrap();
    assert_eq!(cas.get_string(token, pos).unwrap(), None);
    assert_eq!(cas.get_double(token, score).unwrap(), 0.0);
    assert_eq!(cas.span(token).unwrap(), (0, 0));
}

#[test]
fn typed_arrays_check_elements_and_bounds() {
    let mut cas = Cas::new(ts()).unwrap();
    let view = cas.initial_view();
    let token_array = cas
        .type_system()
        .array_type_for(ty(&cas, "org.example.Token"))
        .unwrap();
    let tokens = cas.create_array(view, token_array, 2).unwrap();
    let token = cas.create(view, ty(&cas, "org.example.Token")).unwrap();
    let entity = cas.create(view, ty(&cas, "org.example.Entity")).unwrap();

    cas.set_array_element(tokens, 0, token.into()).unwrap();
    assert!(matches!(
        cas.set_array_element(tokens, 1, entity.into()),
        Err(CasError::TypeMismatch { .. })
    ));
    assert_eq!(
        cas.set_array_element(tokens, 2, token.into()),
        Err(CasError::IndexOutOfRange { index: 2, len: 2 })
    );
    assert_eq!(
        cas.array_elements(tokens).unwrap(),
        vec![FeatureValue::Ref(Some(token)), FeatureValue::Ref(None)]
    );
    assert!(matches!(
        cas.create(view, token_array),
        Err(CasError::NotCreatable(_))
    ));
    assert!(matches!(
        cas.create_array(view, ty(&cas, "org.example.Token"), 1),
        Err(CasError::NotCreatable(_))
    ));

    let ints = cas
        .create_array(view, ty(&cas, builtin::INTEGER_ARRAY), 3)
        .unwrap();
    cas.set_array_element(ints, 1, 7.into()).unwrap();
    assert_eq!(cas.array_len(ints).unwrap(), 3);
    assert_eq!(cas.get_array_element(ints, 1).unwrap(), FeatureValue::Int(7));
}

#[test]
fn views_are_unique_and_bound_to_their_sofa() {
    let mut cas = Cas::new(ts()).unwrap();
    let initial = cas.initial_view();
    let gold = cas.create_view("gold").unwrap();
    assert_eq!(cas.create_view("gold"), Err(CasError::DuplicateView("gold".into())));
    assert_eq!(cas.get_view("gold").unwrap(), gold);
    assert_eq!(
        cas.get_view("silver"),
        Err(CasError::ViewNotFound("silver".into()))
    );
    assert_eq!(cas.views().count(), 2);

    let sofa_num = cas.type_system().builtins().sofa_num;
    let gold_sofa = cas.view_sofa(gold).unwrap();
    assert_eq!(cas.get_int(gold_sofa, sofa_num).unwrap(), 2);

    let token = ty(&cas, "org.example.Token");
    let in_gold = cas.create_annotation(gold, token, 0, 1).unwrap();
    assert!(matches!(
        cas.add_to_index(initial, in_gold),
        Err(CasError::CrossViewIndex { .. })
    ));
    cas.add_to_index(gold, in_gold).unwrap();

    // Structures not bound to a sofa can be indexed anywhere.
    let entity = cas.create(gold, ty(&cas, "org.example.Entity")).unwrap();
    cas.add_to_index(initial, entity).unwrap();
    cas.add_to_index(gold, entity).unwrap();
    assert_eq!(cas.all_indexed(initial).unwrap(), vec![entity]);
    assert_eq!(cas.all_indexed(gold).unwrap(), vec![in_gold, entity]);
}

#[test]
fn each_view_has_its_own_text() {
    let mut cas = Cas::new(ts()).unwrap();
    let initial = cas.initial_view();
    let translation = cas.create_view("translation").unwrap();
    cas.set_document_text(initial, "the cat").unwrap();
    cas.set_sofa_data_string(translation, "le chat", "text/plain")
        .unwrap();
    assert_eq!(cas.document_text(initial).unwrap(), Some("the cat"));
    assert_eq!(cas.document_text(translation).unwrap(), Some("le chat"));
    assert_eq!(cas.mime_type(translation).unwrap(), Some("text/plain"));

    let token = ty(&cas, "org.example.Token");
    let chat = cas.create_annotation(translation, token, 3, 7).unwrap();
    assert_eq!(cas.covered_text(chat).unwrap(), "chat");
}

#[test]
fn sofa_uri_and_array_data() {
    let mut cas = Cas::new(ts()).unwrap();
    let audio = cas.create_view("audio").unwrap();
    cas.set_sofa_data_uri(audio, "file:///tmp/a.wav", "audio/wav")
        .unwrap();
    assert_eq!(cas.sofa_uri(audio).unwrap(), Some("file:///tmp/a.wav"));
    assert_eq!(cas.document_text(audio).unwrap(), None);

    let samples = cas.create_view("samples").unwrap();
    let data = cas
        .create_array(samples, ty(&cas, builtin::DOUBLE_ARRAY), 4)
        .unwrap();
    let entity = cas.create(samples, ty(&cas, "org.example.Entity")).unwrap();
    assert!(matches!(
        cas.set_sofa_data_array(samples, entity, "application/x-samples"),
        Err(CasError::TypeMismatch { .. })
    ));
    cas.set_sofa_data_array(samples, data, "application/x-samples")
        .unwrap();
    assert_eq!(cas.sofa_data_array(samples).unwrap(), Some(data));
}

#[test]
fn user_indexes_follow_their_keys() {
    let mut cas = Cas::new(ts()).unwrap();
    let view = cas.initial_view();
    let by_score = IndexSpec::new("ByScore", "org.example.Token", IndexKind::Sorted)
        .with_key("score", KeyDirection::Reverse);
    cas.declare_index(view, &by_score).unwrap();
    // Redeclaring the same index is fine, a different one under the label is not.
    cas.declare_index(view, &by_score).unwrap();
    assert!(matches!(
        cas.declare_index(
            view,
            &IndexSpec::new("ByScore", "org.example.Token", IndexKind::Bag)
        ),
        Err(CasError::IndexDefinition(_))
    ));

    let token = ty(&cas, "org.example.Token");
    let mut created = Vec::new();
    for (i, score) in [0.5, 2.0, 1.0].into_iter().enumerate() {
        let fs = cas.create_annotation(view, token, i as i32, i as i32 + 1).unwrap();
        let feature = cas.feature_by_name(fs, "score").unwrap();
        cas.set_double(fs, feature, score).unwrap();
        cas.add_to_index(view, fs).unwrap();
        created.push(fs);
    }
    let order: Vec<FsRef> = cas.iter(view, "ByScore", None).unwrap().collect();
    assert_eq!(order, vec![created[1], created[2], created[0]]);

    // Changing a key re-sorts the structure.
    let score = cas.feature_by_name(created[0], "score").unwrap();
    cas.set_double(created[0], score, 9.0).unwrap();
    let order: Vec<FsRef> = cas.iter(view, "ByScore", None).unwrap().collect();
    assert_eq!(order, vec![created[0], created[1], created[2]]);

    assert_eq!(cas.index_size(view, "ByScore").unwrap(), 3);
    assert!(matches!(
        cas.iter(view, "Missing", None),
        Err(CasError::UnknownIndex(_))
    ));
}

#[test]
fn set_and_bag_indexes_are_idempotent_as_documented() {
    let mut cas = Cas::new(ts()).unwrap();
    let view = cas.initial_view();
    cas.declare_index(
        view,
        &IndexSpec::new("Spans", "org.example.Token", IndexKind::Set)
            .with_key("begin", KeyDirection::Standard)
            .with_key("end", KeyDirection::Standard),
    )
    .unwrap();
    cas.declare_index(view, &IndexSpec::new("All", "org.example.Token", IndexKind::Bag))
        .unwrap();

    let token = ty(&cas, "org.example.Token");
    let a = cas.create_annotation(view, token, 0, 3).unwrap();
    let twin = cas.create_annotation(view, token, 0, 3).unwrap();
    cas.add_to_index(view, a).unwrap();
    cas.add_to_index(view, a).unwrap();
    cas.add_to_index(view, twin).unwrap();

    assert_eq!(cas.index_size(view, "Spans").unwrap(), 1);
    assert_eq!(cas.index_size(view, "All").unwrap(), 3);
    assert_eq!(cas.index_size(view, ANNOTATION_INDEX).unwrap(), 3);

    assert!(cas.remove_from_index(view, a).unwrap());
    assert_eq!(cas.index_size(view, "All").unwrap(), 2);
    assert!(cas.contains(view, "All", a).unwrap());
    assert!(cas.remove_from_index(view, a).unwrap());
    assert!(!cas.remove_from_index(view, a).unwrap());
    assert!(!cas.contains(view, "All", a).unwrap());
}

#[test]
fn narrowed_iteration_and_select_covered() {
    let mut cas = Cas::new(ts()).unwrap();
    let view = cas.initial_view();
    cas.set_document_text(view, "cat sat. dog ran.").unwrap();
    let token = ty(&cas, "org.example.Token");
    let sentence = ty(&cas, "org.example.Sentence");
    let first = cas.create_annotation(view, sentence, 0, 8).unwrap();
    let second = cas.create_annotation(view, sentence, 9, 17).unwrap();
    let mut tokens = Vec::new();
    for (b, e) in [(0, 3), (4, 7), (9, 12), (13, 16)] {
        let fs = cas.create_annotation(view, token, b, e).unwrap();
        cas.add_to_index(view, fs).unwrap();
        tokens.push(fs);
    }
    cas.add_to_index(view, first).unwrap();
    cas.add_to_index(view, second).unwrap();

    let only_tokens: Vec<FsRef> = cas
        .iter(view, ANNOTATION_INDEX, Some(token))
        .unwrap()
        .collect();
    assert_eq!(only_tokens, tokens);
    assert_eq!(cas.select_covered(view, token, second).unwrap(), tokens[2..]);
    assert_eq!(
        spans(&cas, cas.select_covered(view, token, first).unwrap()),
        vec![(0, 3), (4, 7)]
    );
}

#[test]
fn type_priority_breaks_ties_between_equal_spans() {
    let mut b = TypeSystemBuilder::new();
    b.declare_type("Sentence", builtin::ANNOTATION).unwrap();
    b.declare_type("Token", builtin::ANNOTATION).unwrap();
    b.declare_priority_list(["Token", "Sentence"]);
    let mut cas = Cas::new(b.commit().unwrap()).unwrap();
    let view = cas.initial_view();
    let sentence = cas.create_annotation(view, ty(&cas, "Sentence"), 0, 3).unwrap();
    let token = cas.create_annotation(view, ty(&cas, "Token"), 0, 3).unwrap();
    cas.add_to_index(view, sentence).unwrap();
    cas.add_to_index(view, token).unwrap();
    let order: Vec<FsRef> = cas.annotation_index(view).unwrap().collect();
    assert_eq!(order, vec![token, sentence]);
}

#[test]
fn configured_indexes_exist_in_every_view_and_after_reset() {
    let config = CasConfig {
        indexes: vec![IndexSpec::new("Entities", "org.example.Entity", IndexKind::Bag)],
        ..CasConfig::default()
    };
    let mut cas = Cas::with_config(ts(), config).unwrap();
    let other = cas.create_view("other").unwrap();
    assert!(cas.index_labels(other).unwrap().contains(&"Entities".to_string()));
    cas.reset();
    let labels = cas.index_labels(cas.initial_view()).unwrap();
    assert_eq!(labels, vec![ANNOTATION_INDEX.to_string(), "Entities".to_string()]);
    assert_eq!(cas.views().count(), 1);
}

#[test]
fn bounds_violations_are_reported() {
    let mut cas = Cas::new(ts()).unwrap();
    let view = cas.initial_view();
    cas.set_document_text(view, "short").unwrap();
    let token = ty(&cas, "org.example.Token");
    let ok = cas.create_annotation(view, token, 0, 5).unwrap();
    let past_end = cas.create_annotation(view, token, 2, 9).unwrap();
    let inverted = cas.create_annotation(view, token, 4, 1).unwrap();
    for fs in [ok, past_end, inverted] {
        cas.add_to_index(view, fs).unwrap();
    }
    let bad: Vec<FsRef> = cas
        .validate_annotation_bounds(view)
        .unwrap()
        .into_iter()
        .map(|v| v.fs)
        .collect();
    assert_eq!(bad.len(), 2);
    assert!(bad.contains(&past_end) && bad.contains(&inverted));
}

#[test]
fn structures_can_be_found_by_type_without_an_index() {
    let mut cas = Cas::new(ts()).unwrap();
    let view = cas.initial_view();
    let token = ty(&cas, "org.example.Token");
    let first = cas.create_annotation(view, token, 0, 3).unwrap();
    let entity = cas.create(view, ty(&cas, "org.example.Entity")).unwrap();
    let sentence = cas
        .create_annotation(view, ty(&cas, "org.example.Sentence"), 0, 7)
        .unwrap();
    let second = cas.create_annotation(view, token, 4, 7).unwrap();

    assert_eq!(cas.all_fs_of_type(token), vec![first, second]);
    assert_eq!(
        cas.all_fs_of_type(ty(&cas, builtin::ANNOTATION)),
        vec![first, sentence, second]
    );
    assert_eq!(cas.all_fs_of_type(ty(&cas, "org.example.Entity")), vec![entity]);
    assert_eq!(cas.all_fs_of_type(ty(&cas, builtin::TOP)), cas.all_fs());
}

const WITH_INDEX: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<typeSystemDescription>
  <types>
    <typeDescription>
      <name>org.example.Word</name>
      <supertypeName>cas.Annotation</supertypeName>
      <features>
        <featureDescription>
          <name>lemma</name>
          <rangeTypeName>cas.String</rangeTypeName>
        </featureDescription>
      </features>
    </typeDescription>
  </types>
  <fsIndexes>
    <fsIndexDescription>
      <label>ByLemma</label>
      <typeName>org.example.Word</typeName>
      <kind>sorted</kind>
      <keys>
        <fsIndexKey>
          <featureName>lemma</featureName>
          <comparator>reverse</comparator>
        </fsIndexKey>
      </keys>
    </fsIndexDescription>
  </fsIndexes>
</typeSystemDescription>
"#;

#[test]
fn descriptor_indexes_exist_in_every_new_view() {
    let parsed = parse_descriptor(WITH_INDEX).unwrap();
    let ts = TypeSystemBuilder::from_description(&parsed.description)
        .unwrap()
        .commit()
        .unwrap();
    let mut cas = Cas::new(ts).unwrap();
    let view = cas.initial_view();
    cas.set_document_text(view, "ant bee").unwrap();
    let word = ty(&cas, "org.example.Word");
    for (begin, end, lemma) in [(0, 3, "ant"), (4, 7, "bee")] {
        let fs = cas.create_annotation(view, word, begin, end).unwrap();
        let f = cas.feature_by_name(fs, "lemma").unwrap();
        cas.set_string(fs, f, Some(lemma)).unwrap();
        cas.add_to_index(view, fs).unwrap();
    }
    let lemmas = |cas: &Cas, view| -> Vec<String> {
        cas.iter(view, "ByLemma", None)
            .unwrap()
            .map(|fs| cas.covered_text(fs).unwrap())
            .collect()
    };
    assert_eq!(lemmas(&cas, view), vec!["bee", "ant"]);

    let other = cas.create_view("other").unwrap();
    assert_eq!(cas.index_size(other, "ByLemma").unwrap(), 0);

    // The embedded type system carries the index too.
    let options = BinaryOptions {
        compressed: false,
        embed_type_system: true,
    };
    let back = deserialize_binary_self_describing(&serialize_binary_with(&cas, &options).unwrap())
        .unwrap();
    assert_eq!(back.type_system().description().indexes.len(), 1);
    assert_eq!(lemmas(&back, back.initial_view()), vec!["bee", "ant"]);
}
