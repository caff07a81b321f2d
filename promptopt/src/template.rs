use crate::{PromptOptError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Instruction text with `{name}` placeholders. `{{` and `}}` are literal braces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub text: String,
    /// Variable names every dataset record must provide.
    pub variables: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment<'a> {
    Literal(&'a str),
    Brace(char),
    Placeholder(&'a str),
}

impl PromptTemplate {
    pub fn new(text: impl Into<String>, variables: Vec<String>) -> Self {
        Self {
            text: text.into(),
            variables,
        }
    }

    /// Declares the placeholders found in `text`, in order of first appearance.
    #[tracing::instrument(skip_all)]
    pub fn infer(text: impl Into<String>) -> Result<Self> {
        let text = text.into();
        let variables = placeholders_of(&text)?;
        Ok(Self { text, variables })
    }

    #[tracing::instrument(skip_all)]
    pub fn placeholders(&self) -> Result<Vec<String>> {
        placeholders_of(&self.text)
    }

    /// Every placeholder must be declared and every declared variable must appear.
    #[tracing::instrument(skip_all)]
    pub fn validate(&self) -> Result<()> {
        let found = self.placeholders()?;
        if let Some(undeclared) = found.iter().find(|p| !self.variables.contains(*p)) {
            return Err(PromptOptError::Template(format!(
                "placeholder '{undeclared}' is not a declared variable"
            )));
        }
        if let Some(unused) = self.variables.iter().find(|v| !found.contains(*v)) {
            return Err(PromptOptError::Template(format!(
                "declared variable '{unused}' does not appear in the template"
            )));
        }
        Ok(())
    }

    /// Substitutes every placeholder. A placeholder with no value is an error.
    #[tracing::instrument(skip_all)]
    pub fn render(&self, vars: &BTreeMap<String, Value>) -> Result<String> {
        render_text(&self.text, vars)
    }
}

#[tracing::instrument(skip_all)]
pub fn render_text(text: &str, vars: &BTreeMap<String, Value>) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    for segment in parse(text)? {
        match segment {
            Segment::Literal(s) => out.push_str(s),
            Segment::Brace(c) => out.push(c),
            Segment::Placeholder(name) => {
                let value = vars.get(name).ok_or_else(|| {
                    PromptOptError::Template(format!("missing value for variable '{name}'"))
                })?;
                out.push_str(&stringify_value(value));
            }
        }
    }
    Ok(out)
}

#[tracing::instrument(skip_all)]
pub fn placeholders_of(text: &str) -> Result<Vec<String>> {
    let mut names: Vec<String> = Vec::new();
    for segment in parse(text)? {
        if let Segment::Placeholder(name) = segment {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}

fn parse(text: &str) -> Result<Vec<Segment<'_>>> {
    let mut segments = Vec::new();
    let bytes = text.as_bytes();
    let mut literal_start = 0usize;
    let mut i = 0usize;

    while i < bytes.len() {
        match bytes[i] {
            b'{' => {
                if literal_start < i {
                    segments.push(Segment::Literal(&text[literal_start..i]));
                }
                if bytes.get(i + 1) == Some(&b'{') {
                    segments.push(Segment::Brace('{'));
                    i += 2;
                } else {
                    let close = text[i + 1..]
                        .find(|c: char| c == '}' || c == '{')
                        .map(|offset| i + 1 + offset);
                    let end = match close {
                        Some(end) if bytes[end] == b'}' => end,
                        _ => {
                            return Err(PromptOptError::Template(format!(
                                "unclosed '{{' at byte {i}"
                            )))
                        }
                    };
                    let name = text[i + 1..end].trim();
                    if name.is_empty() {
                        return Err(PromptOptError::Template(format!(
                            "empty placeholder at byte {i}"
                        )));
                    }
                    segments.push(Segment::Placeholder(name));
                    i = end + 1;
                }
                literal_start = i;
            }
            b'}' => {
                if literal_start < i {
                    segments.push(Segment::Literal(&text[literal_start..i]));
                }
                if bytes.get(i + 1) == Some(&b'}') {
                    segments.push(Segment::Brace('}'));
                    i += 2;
                    literal_start = i;
                } else {
                    return Err(PromptOptError::Template(format!(
                        "single '}}' encountered at byte {i}"
                    )));
                }
            }
            _ => i += 1,
        }
    }
    if literal_start < bytes.len() {
        segments.push(Segment::Literal(&text[literal_start..]));
    }
    Ok(segments)
}

fn stringify_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Number(num) => num.to_string(),
        Value::Bool(flag) => flag.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn renders_every_placeholder() {
        let t = PromptTemplate::infer("Summarize the following {language} text: {text}").unwrap();
        assert_eq!(t.variables, vec!["language", "text"]);
        let out = t
            .render(&vars(&[
                ("language", json!("english")),
                ("text", json!("Hello there.")),
                ("unused", json!("ignored")),
            ]))
            .unwrap();
        assert_eq!(out, "Summarize the following english text: Hello there.");
    }

    #[test]
    fn repeated_placeholder_is_declared_once() {
        let t = PromptTemplate::infer("{a} and {b} and {a}").unwrap();
        assert_eq!(t.variables, vec!["a", "b"]);
        let out = t
            .render(&vars(&[("a", json!("x")), ("b", json!(2))]))
            .unwrap();
        assert_eq!(out, "x and 2 and x");
    }

    #[test]
    fn doubled_braces_are_literal() {
        let t = PromptTemplate::infer("Return JSON like {{\"answer\": ...}} for {q}").unwrap();
        assert_eq!(t.variables, vec!["q"]);
        let out = t.render(&vars(&[("q", json!("why"))])).unwrap();
        assert_eq!(out, "Return JSON like {\"answer\": ...} for why");
    }

    #[test]
    fn missing_value_is_a_template_error() {
        let t = PromptTemplate::infer("Translate {text} to {language}").unwrap();
        let err = t.render(&vars(&[("text", json!("hi"))])).unwrap_err();
        match err {
            PromptOptError::Template(msg) => assert!(msg.contains("language")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn malformed_templates_are_rejected() {
        assert!(PromptTemplate::infer("open {text").is_err());
        assert!(PromptTemplate::infer("stray } brace").is_err());
        assert!(PromptTemplate::infer("empty {} slot").is_err());
    }

    #[test]
    fn non_string_values_render_compactly() {
        let out = render_text(
            "{obj} {flag} {none}|",
            &vars(&[
                ("obj", json!({"k": [1, 2]})),
                ("flag", json!(true)),
                ("none", Value::Null),
            ]),
        )
        .unwrap();
        assert_eq!(out, "{\"k\":[1,2]} true |");
    }

    #[test]
    fn validate_checks_declared_against_found() {
        let ok = PromptTemplate::new("Hi {name}", vec!["name".to_string()]);
        assert!(ok.validate().is_ok());

        let undeclared = PromptTemplate::new("Hi {name} {extra}", vec!["name".to_string()]);
        assert!(undeclared.validate().is_err());

        let unused = PromptTemplate::new(
            "Hi {name}",
            vec!["name".to_string(), "missing".to_string()],
        );
        assert!(unused.validate().is_err());
    }

    proptest! {
        #[test]
        fn rendering_fills_every_declared_variable(
            entries in prop::collection::btree_map("[a-z][a-z0-9_]{0,8}", "[A-Za-z0-9 .,:]{0,30}", 1..5),
            filler in prop::collection::vec("[A-Za-z ,.:]{0,20}", 5),
            extra in "[A-Za-z0-9 ]{0,10}",
        ) {
            let mut text = String::new();
            let mut expected = String::new();
            for (i, (name, value)) in entries.iter().enumerate() {
                text.push_str(&filler[i]);
                text.push_str(&format!("{{{name}}}"));
                expected.push_str(&filler[i]);
                expected.push_str(value);
            }

            let template = PromptTemplate::infer(text).unwrap();
            prop_assert_eq!(template.variables.len(), entries.len());
            prop_assert!(template.validate().is_ok());

            let mut record: BTreeMap<String, Value> = entries
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            record.insert("ZZ_not_declared".to_string(), Value::String(extra));

            let out = template.render(&record).unwrap();
            prop_assert_eq!(&out, &expected);
            prop_assert!(!out.contains('{') && !out.contains('}'), "output contains braces: {:?}", out);

            let dropped = entries.keys().next().unwrap();
            record.remove(dropped);
            prop_assert!(template.render(&record).is_err());
        }
    }
}
