//! Logic-less template engine.
//!
//! Supports the subset of mustache used by the web interface:
//!
//! - `{{name}}` HTML-escaped variable
//! - `{{{name}}}` raw variable
//! - `{{#name}}...{{/name}}` section, rendered once per list element,
//!   once for a mapping or other truthy value, and skipped for falsy values
//! - `{{>name}}` partial, resolved through a [`TemplateSource`] at render time
//!
//! Contexts are [`serde_json::Value`]s. Variables are looked up through the
//! chain of enclosing section scopes, innermost first.

use crate::error::Error;
use crate::utils::escape_html;
use serde_json::Value;
use std::borrow::Cow;
use std::collections::HashMap;

/// Partials nested deeper than this are assumed to be recursive.
const MAX_PARTIAL_DEPTH: usize = 32;

/// Lookup table resolving partial names to template source text.
pub trait TemplateSource {
    /// Returns the source of the template called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTemplate`] if there is no such template.
    fn template_source(&self, name: &str) -> Result<Cow<'_, str>, Error>;
}

impl TemplateSource for HashMap<String, String> {
    fn template_source(&self, name: &str) -> Result<Cow<'_, str>, Error> {
        self.get(name)
            .map(|source| Cow::Borrowed(source.as_str()))
            .ok_or_else(|| Error::UnknownTemplate(name.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Literal(String),
    Variable { name: String, escape: bool },
    Section { name: String, children: Vec<Node> },
    Partial(String),
}

/// A parsed template.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    nodes: Vec<Node>,
}

struct OpenSection {
    name: String,
    offset: usize,
    nodes: Vec<Node>,
}

fn malformed(offset: usize, reason: &'static str) -> Error {
    Error::MalformedTemplate { offset, reason }
}

fn tag_name(raw: &str, offset: usize) -> Result<String, Error> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(malformed(offset, "empty tag name"));
    }
    if !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return Err(malformed(offset, "invalid tag name"));
    }
    Ok(name.to_string())
}

/// Nodes of the innermost open section, or the top level.
fn current<'a>(root: &'a mut Vec<Node>, open: &'a mut [OpenSection]) -> &'a mut Vec<Node> {
    match open.last_mut() {
        Some(section) => &mut section.nodes,
        None => root,
    }
}

/// Parses template source text.
///
/// # Errors
///
/// Returns [`Error::MalformedTemplate`] for unterminated tags, invalid tag
/// names, unbalanced or mismatched section tags.
pub fn parse(source: &str) -> Result<Template, Error> {
    let mut root = Vec::new();
    let mut open: Vec<OpenSection> = Vec::new();
    let mut rest = source;

    while let Some((literal, tail)) = rest.split_once("{{") {
        let offset = source.len() - rest.len() + literal.len();
        if !literal.is_empty() {
            current(&mut root, &mut open).push(Node::Literal(literal.to_string()));
        }

        if let Some(inner) = tail.strip_prefix('{') {
            let (tag, remainder) = inner
                .split_once("}}}")
                .ok_or_else(|| malformed(offset, "unterminated tag"))?;
            rest = remainder;
            let name = tag_name(tag, offset)?;
            current(&mut root, &mut open).push(Node::Variable {
                name,
                escape: false,
            });
            continue;
        }

        let (tag, remainder) = tail
            .split_once("}}")
            .ok_or_else(|| malformed(offset, "unterminated tag"))?;
        rest = remainder;
        let tag = tag.trim();

        if let Some(name) = tag.strip_prefix('#') {
            open.push(OpenSection {
                name: tag_name(name, offset)?,
                offset,
                nodes: Vec::new(),
            });
        } else if let Some(name) = tag.strip_prefix('/') {
            let name = tag_name(name, offset)?;
            let section = open
                .pop()
                .ok_or_else(|| malformed(offset, "closing tag without open section"))?;
            if section.name != name {
                return Err(malformed(offset, "mismatched section close"));
            }
            current(&mut root, &mut open).push(Node::Section {
                name,
                children: section.nodes,
            });
        } else if let Some(name) = tag.strip_prefix('>') {
            let name = tag_name(name, offset)?;
            current(&mut root, &mut open).push(Node::Partial(name));
        } else {
            let name = tag_name(tag, offset)?;
            current(&mut root, &mut open).push(Node::Variable { name, escape: true });
        }
    }

    if let Some(section) = open.pop() {
        return Err(malformed(section.offset, "unclosed section"));
    }
    if !rest.is_empty() {
        root.push(Node::Literal(rest.to_string()));
    }

    Ok(Template { nodes: root })
}

/// Stack of lookup scopes, outermost first.
struct ContextChain<'c> {
    scopes: Vec<&'c Value>,
}

impl<'c> ContextChain<'c> {
    fn lookup(&self, name: &str) -> Option<&'c Value> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.as_object().and_then(|map| map.get(name)))
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Number(_) | Value::Object(_) => true,
    }
}

fn stringify(value: &Value) -> Cow<'_, str> {
    match value {
        Value::String(s) => Cow::Borrowed(s),
        Value::Number(n) => Cow::Owned(n.to_string()),
        Value::Bool(b) => Cow::Owned(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => Cow::Borrowed(""),
    }
}

impl Template {
    /// Renders the template against `context`, resolving partials in `templates`.
    ///
    /// # Errors
    ///
    /// Fails if a partial is unknown, malformed, or nested too deeply.
    pub fn render<S>(&self, context: &Value, templates: &S) -> Result<String, Error>
    where
        S: TemplateSource + ?Sized,
    {
        let mut chain = ContextChain {
            scopes: vec![context],
        };
        let mut out = String::new();
        render_nodes(&self.nodes, &mut chain, templates, 0, &mut out)?;
        Ok(out)
    }
}

fn render_nodes<'c, S>(
    nodes: &[Node],
    chain: &mut ContextChain<'c>,
    templates: &S,
    depth: usize,
    out: &mut String,
) -> Result<(), Error>
where
    S: TemplateSource + ?Sized,
{
    for node in nodes {
        match node {
            Node::Literal(text) => out.push_str(text),
            Node::Variable { name, escape } => {
                if let Some(value) = chain.lookup(name) {
                    let text = stringify(value);
                    if *escape {
                        out.push_str(&escape_html(&text));
                    } else {
                        out.push_str(&text);
                    }
                }
            }
            Node::Section { name, children } => {
                let Some(value) = chain.lookup(name) else {
                    continue;
                };
                if !is_truthy(value) {
                    continue;
                }
                let scopes: Vec<&'c Value> = match value {
                    Value::Array(items) => items.iter().collect(),
                    other => vec![other],
                };
                for scope in scopes {
                    chain.scopes.push(scope);
                    let result = render_nodes(children, chain, templates, depth, out);
                    chain.scopes.pop();
                    result?;
                }
            }
            Node::Partial(name) => {
                if depth >= MAX_PARTIAL_DEPTH {
                    return Err(Error::PartialDepth(name.clone()));
                }
                let source = templates.template_source(name)?;
                let partial = parse(&source)?;
                render_nodes(&partial.nodes, chain, templates, depth + 1, out)?;
            }
        }
    }
    Ok(())
}

/// Renders templates from a shared [`TemplateSource`].
#[derive(Debug)]
pub struct Renderer<S> {
    templates: S,
}

impl<S: TemplateSource> Renderer<S> {
    pub fn new(templates: S) -> Self {
        Self { templates }
    }

    /// Parses and renders `source` against `context`.
    pub fn render(&self, source: &str, context: &Value) -> Result<String, Error> {
        parse(source)?.render(context, &self.templates)
    }

    /// Renders the template registered as `name`.
    pub fn render_named(&self, name: &str, context: &Value) -> Result<String, Error> {
        let source = self.templates.template_source(name)?;
        self.render(&source, context)
    }

    #[cfg(test)]
    pub fn templates(&self) -> &S {
        &self.templates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;
    use serde_json::json;
    use testresult::TestResult;

    fn table(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(name, source)| (name.to_string(), source.to_string()))
            .collect()
    }

    #[fixture]
    fn renderer() -> Renderer<HashMap<String, String>> {
        Renderer::new(HashMap::new())
    }

    #[rstest]
    #[case::no_tags("x", json!({}), "x")]
    #[case::missing_variable("x {{a}}b", json!({}), "x b")]
    #[case::number("x {{a}}b", json!({"a": 42}), "x 42b")]
    #[case::raw("x {{{a}}}b", json!({"a": "'\"<ä>&"}), "x '\"<ä>&b")]
    #[case::escaped("x {{a}}b", json!({"a": "z'y\"<ä>&"}), "x z&#x27;y&quot;&lt;ä&gt;&amp;b")]
    #[case::several(
        "a={{a}} b={{b}} c={{c}} u_s={{under_score}}",
        json!({"a": 1, "b": 2, "c": 3, "under_score": 4}),
        "a=1 b=2 c=3 u_s=4"
    )]
    #[case::whitespace_in_tag("<{{ a }}|{{{ a }}}>", json!({"a": "&"}), "<&amp;|&>")]
    #[case::falsy_scalar_variable("[{{zero}}][{{empty}}][{{no}}]", json!({"zero": 0, "empty": "", "no": false}), "[0][][false]")]
    #[case::null_variable("[{{a}}]", json!({"a": null}), "[]")]
    fn test_basics(
        renderer: Renderer<HashMap<String, String>>,
        #[case] source: &str,
        #[case] context: Value,
        #[case] expected: &str,
    ) -> TestResult {
        assert_eq!(renderer.render(source, &context)?, expected);
        Ok(())
    }

    #[test]
    fn test_include() -> TestResult {
        let renderer = Renderer::new(table(&[
            ("t1", "this is t1.\n{{>t2}}/t1"),
            ("t2", "this is t2:{{val}}/t2"),
        ]));
        let result = renderer.render("> {{>t1}} <", &json!({"val": 42}))?;
        assert_eq!(result, "> this is t1.\nthis is t2:42/t2/t1 <");
        Ok(())
    }

    #[test]
    fn test_include_inside_section_sees_loop_scope() -> TestResult {
        let renderer = Renderer::new(table(&[("item", "<{{name}}@{{site}}>")]));
        let context = json!({"site": "s", "items": [{"name": "a"}, {"name": "b", "site": "t"}]});
        let result = renderer.render("{{#items}}{{>item}}{{/items}}", &context)?;
        assert_eq!(result, "<a@s><b@t>");
        Ok(())
    }

    #[test]
    fn test_loop() -> TestResult {
        let renderer = Renderer::new(HashMap::new());
        assert_eq!(
            renderer.render("invis{{#emptyloop}}none{{/emptyloop}}ible", &json!({}))?,
            "invisible"
        );

        let context = json!({
            "a": "a",
            "x": [
                {"y": "1"},
                {"y": "2"},
                {"y": "3"},
                {"y": "4", "a": "b"},
            ],
        });
        let result = renderer.render(
            "{{#x}}loop:{{a}}{{y}}\n{{/x}} invis{{#emptyloop}}none{{/emptyloop}}ible",
            &context,
        )?;
        assert_eq!(
            result,
            "loop:a1\nloop:a2\nloop:a3\nloop:b4\n invisible"
        );
        Ok(())
    }

    #[rstest]
    #[case::mapping(json!({"s": {"v": "in"}, "v": "out"}), "[in]")]
    #[case::string(json!({"s": "yes", "v": "out"}), "[out]")]
    #[case::number(json!({"s": 0, "v": "out"}), "[out]")]
    #[case::true_value(json!({"s": true, "v": "out"}), "[out]")]
    #[case::false_value(json!({"s": false, "v": "out"}), "")]
    #[case::null(json!({"s": null, "v": "out"}), "")]
    #[case::empty_string(json!({"s": "", "v": "out"}), "")]
    #[case::empty_list(json!({"s": [], "v": "out"}), "")]
    #[case::scalar_list(json!({"s": [1, 2], "v": "out"}), "[out][out]")]
    fn test_section_truthiness(
        renderer: Renderer<HashMap<String, String>>,
        #[case] context: Value,
        #[case] expected: &str,
    ) -> TestResult {
        assert_eq!(renderer.render("{{#s}}[{{v}}]{{/s}}", &context)?, expected);
        Ok(())
    }

    #[test]
    fn test_nested_sections() -> TestResult {
        let renderer = Renderer::new(HashMap::new());
        let context = json!({
            "outer": "o",
            "mails": [
                {"id": 1, "parts": [{"t": "a"}, {"t": "b"}]},
                {"id": 2, "parts": []},
            ],
        });
        let result = renderer.render(
            "{{#mails}}{{id}}:{{#parts}}{{outer}}{{id}}{{t}} {{/parts}};{{/mails}}",
            &context,
        )?;
        assert_eq!(result, "1:o1a o1b ;2:;");
        Ok(())
    }

    #[rstest]
    #[case::unterminated("x {{a", 2)]
    #[case::unterminated_raw("x {{{a}} y", 2)]
    #[case::mismatched("{{#a}}x{{/b}}", 7)]
    #[case::unclosed("ab{{#a}}x", 2)]
    #[case::close_without_open("{{/a}}", 0)]
    #[case::dotted_name("{{a.b}}", 0)]
    #[case::inverted("{{^a}}x{{/a}}", 0)]
    #[case::comment("{{! note }}", 0)]
    #[case::empty("{{}}", 0)]
    fn test_malformed(#[case] source: &str, #[case] expected_offset: usize) {
        match parse(source) {
            Err(Error::MalformedTemplate { offset, .. }) => assert_eq!(offset, expected_offset),
            other => panic!("expected MalformedTemplate, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_partial() {
        let renderer = Renderer::new(HashMap::new());
        let result = renderer.render("a{{>missing}}b", &json!({}));
        assert!(matches!(result, Err(Error::UnknownTemplate(name)) if name == "missing"));
    }

    #[test]
    fn test_unknown_partial_in_skipped_section_is_not_resolved() -> TestResult {
        let renderer = Renderer::new(HashMap::new());
        assert_eq!(renderer.render("a{{#no}}{{>missing}}{{/no}}b", &json!({}))?, "ab");
        Ok(())
    }

    #[test]
    fn test_recursive_partial() {
        let renderer = Renderer::new(table(&[("loop", "x{{>loop}}")]));
        let result = renderer.render_named("loop", &json!({}));
        assert!(matches!(result, Err(Error::PartialDepth(_))));
    }

    #[test]
    fn test_render_is_deterministic() -> TestResult {
        let renderer = Renderer::new(table(&[]));
        let template = parse("{{#xs}}[{{v}}]{{/xs}}")?;
        let context = json!({"xs": [{"v": 1}, {"v": "<"}]});
        let first = template.render(&context, renderer.templates())?;
        let second = template.render(&context, renderer.templates())?;
        assert_eq!(first, "[1][&lt;]");
        assert_eq!(first, second);
        Ok(())
    }
}
