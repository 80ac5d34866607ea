//! Plain-text rendering of a CAS for `casgraph dump`.

use anyhow::Result;
use std::fmt::Write;

use casgraph_core::{Cas, FeatureValue, FsRef};
use casgraph_types::digest::format_fingerprint;
use casgraph_types::{TypeCode, TypeKind};

/// Longest covered text shown inline before it is cut.
const MAX_COVERED: usize = 40;

fn value_text(value: &FeatureValue) -> String {
    match value {
        FeatureValue::Boolean(v) => v.to_string(),
        FeatureValue::Byte(v) => v.to_string(),
        FeatureValue::Short(v) => v.to_string(),
        FeatureValue::Int(v) => v.to_string(),
        FeatureValue::Long(v) => v.to_string(),
        FeatureValue::Float(v) => v.to_string(),
        FeatureValue::Double(v) => v.to_string(),
        FeatureValue::String(Some(s)) => format!("{s:?}"),
        FeatureValue::Ref(Some(fs)) => fs.to_string(),
        FeatureValue::String(None) | FeatureValue::Ref(None) => "null".to_string(),
    }
}

fn clip(text: &str) -> String {
    if text.chars().count() <= MAX_COVERED {
        return format!("{text:?}");
    }
    let head: String = text.chars().take(MAX_COVERED).collect();
    format!("{head:?}...")
}

/// `#id Type`, plus the span and covered text for annotations or the length
/// for arrays.
pub fn fs_summary(cas: &Cas, fs: FsRef) -> Result<String> {
    let ts = cas.type_system();
    let ty = cas.type_of(fs)?;
    let mut line = format!("{fs} {}", ts.type_name(ty));
    if ts.subsumes(ts.builtins().annotation, ty) {
        let (begin, end) = cas.span(fs)?;
        write!(line, " [{begin}..{end}]")?;
        if let Ok(covered) = cas.covered_text(fs) {
            write!(line, " {}", clip(&covered))?;
        }
    } else if ts.type_info(ty).is_array() {
        write!(line, " [len {}]", cas.array_len(fs)?)?;
    }
    Ok(line)
}

/// Every feature (or element) of `fs` as `name=value` pairs.
pub fn fs_values(cas: &Cas, fs: FsRef) -> Result<String> {
    let ts = cas.type_system();
    let ty = cas.type_of(fs)?;
    let parts: Vec<String> = if ts.type_info(ty).is_array() {
        cas.array_elements(fs)?.iter().map(value_text).collect()
    } else {
        let mut parts = Vec::new();
        for feature in ts.features_of(ty) {
            let value = cas.get_feature_value(fs, *feature)?;
            parts.push(format!("{}={}", ts.feature_info(*feature).name(), value_text(&value)));
        }
        parts
    };
    Ok(parts.join(" "))
}

/// Views, their subject of analysis and index contents, then a count of
/// heap structures per type. With `select`, also list every structure of
/// that type with its feature values.
pub fn render(cas: &Cas, select: Option<TypeCode>) -> Result<String> {
    let ts = cas.type_system();
    let mut out = String::new();
    writeln!(out, "structures: {}", cas.fs_count())?;
    writeln!(out, "type system: {}", format_fingerprint(ts.fingerprint()))?;

    for view in cas.views() {
        writeln!(out, "view {}", cas.view_name(view)?)?;
        let mime = cas.mime_type(view)?.unwrap_or("-");
        if let Some(text) = cas.document_text(view)? {
            writeln!(out, "  text ({mime}, {} chars): {}", text.chars().count(), clip(text))?;
        } else if let Some(uri) = cas.sofa_uri(view)? {
            writeln!(out, "  uri ({mime}): {uri}")?;
        } else if let Some(array) = cas.sofa_data_array(view)? {
            writeln!(out, "  data ({mime}): {}", fs_summary(cas, array)?)?;
        }
        for label in cas.index_labels(view)? {
            writeln!(out, "  index {label} ({})", cas.index_size(view, &label)?)?;
            for fs in cas.iter(view, &label, None)? {
                writeln!(out, "    {}", fs_summary(cas, fs)?)?;
            }
        }
    }

    writeln!(out, "by type (including subtypes):")?;
    for info in ts.types() {
        if matches!(info.kind(), TypeKind::Top) {
            continue;
        }
        let count = cas.all_fs_of_type(info.code()).len();
        if count > 0 {
            writeln!(out, "  {} {count}", info.name())?;
        }
    }

    if let Some(ty) = select {
        let selected = cas.all_fs_of_type(ty);
        writeln!(out, "{} ({})", ts.type_name(ty), selected.len())?;
        for fs in selected {
            writeln!(out, "  {}", fs_summary(cas, fs)?)?;
            let values = fs_values(cas, fs)?;
            if !values.is_empty() {
                writeln!(out, "    {values}")?;
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use casgraph_types::builtin;
    use casgraph_types::TypeSystemBuilder;

    fn sample() -> Cas {
        let mut b = TypeSystemBuilder::new();
        b.declare_type("Token", builtin::ANNOTATION).unwrap();
        b.declare_feature("Token", "lemma", builtin::STRING, false)
            .unwrap();
        b.declare_type("Note", builtin::TOP).unwrap();
        b.declare_feature("Note", "about", "Token", false).unwrap();
        let ts = b.commit().unwrap();

        let mut cas = Cas::new(ts).unwrap();
        let view = cas.initial_view();
        cas.set_document_text(view, "cat sat").unwrap();
        let token = cas.type_system().get_type("Token").unwrap();
        let cat = cas.create_annotation(view, token, 0, 3).unwrap();
        let lemma = cas.feature_by_name(cat, "lemma").unwrap();
        cas.set_string(cat, lemma, Some("cat")).unwrap();
        cas.add_to_index(view, cat).unwrap();
        let note_ty = cas.type_system().get_type("Note").unwrap();
        let note = cas.create(view, note_ty).unwrap();
        let about = cas.feature_by_name(note, "about").unwrap();
        cas.set_ref(note, about, Some(cat)).unwrap();
        cas
    }

    #[test]
    fn annotations_show_span_and_text() {
        let cas = sample();
        let text = render(&cas, None).unwrap();
        assert!(text.contains("view _InitialView"));
        assert!(text.contains("text (text, 7 chars): \"cat sat\""));
        assert!(text.contains("index AnnotationIndex (1)"));
        assert!(text.contains("Token [0..3] \"cat\""));
        assert!(text.contains("  Token 1\n"));
        assert!(text.contains("  Note 1\n"));
    }

    #[test]
    fn selected_type_lists_feature_values() {
        let cas = sample();
        let note = cas.type_system().get_type("Note").unwrap();
        let text = render(&cas, Some(note)).unwrap();
        let cat = cas.all_fs_of_type(cas.type_system().get_type("Token").unwrap())[0];
        assert!(text.contains("Note (1)"));
        assert!(text.contains(&format!("about={cat}")));
    }

    #[test]
    fn long_text_is_clipped() {
        let long = "x".repeat(MAX_COVERED + 5);
        assert!(clip(&long).ends_with("..."));
        assert_eq!(clip("short"), "\"short\"");
    }
}
