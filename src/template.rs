//! Template engine for dynamic responses.
//!
//! Mock files are Handlebars templates of YAML documents. A template is
//! expanded with the normalized request body as its context, parsed as YAML,
//! and its `response` field becomes the payload returned to the client.

use crate::body::BodyContext;
use crate::catalog::{conventional_source, Catalog};
use handlebars::{
    Context, Handlebars, Helper, HelperDef, HelperResult, Output, RenderContext,
    RenderErrorReason, Renderable, ScopedJson,
};
use serde_json::Value;
use serde_yaml::Value as YamlValue;
use thiserror::Error;
use tracing::info;

/// Field of the expanded document that holds the response payload.
pub const RESPONSE_FIELD: &str = "response";

/// Block and comparison helpers that a bare `{{name}}` still resolves to.
/// Called without parameters they fail, so a shadowed body key is never
/// silently dropped.
const SHADOWING_BUILTINS: &[&str] = &[
    "if", "unless", "each", "with", "eq", "ne", "gt", "gte", "lt", "lte", "and", "or", "not",
];

/// Failure while producing a response from a matched definition.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("template {name} not found")]
    TemplateNotFound { name: String },

    #[error("failed to expand template {name}: {message}")]
    TemplateSyntax { name: String, message: String },

    #[error("expanded template {name} is not a valid document: {message}")]
    InvalidDocument { name: String, message: String },

    #[error("expanded template {name} has no `response` field")]
    MissingResponseField { name: String },
}

/// Output of a successful render.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendered {
    /// Template file name, relative to the catalog root
    pub template: String,
    /// Expanded template text
    pub document: String,
    /// The document's `response` field
    pub response: Value,
}

/// Template engine for rendering dynamic responses.
pub struct TemplateEngine {
    handlebars: Handlebars<'static>,
    extension: String,
}

impl TemplateEngine {
    /// Create a new template engine looking up `<path>.<extension>`.
    pub fn new(extension: impl Into<String>) -> Self {
        let mut handlebars = Handlebars::new();

        // Undefined variables are errors, never empty strings
        handlebars.set_strict_mode(true);

        // Built-ins a body key could hide behind, replaced by versions that
        // fall back to the body key of the same name
        handlebars.register_helper("raw", Box::new(RawHelper));
        handlebars.register_helper("log", Box::new(log_helper));
        handlebars.register_helper("lookup", Box::new(LookupHelper));
        handlebars.register_helper("len", Box::new(LenHelper));

        handlebars.register_helper("json", Box::new(json_helper));
        handlebars.register_helper("upper", Box::new(upper_helper));
        handlebars.register_helper("lower", Box::new(lower_helper));
        handlebars.register_helper("now", Box::new(now_helper));
        handlebars.register_helper("uuid", Box::new(uuid_helper));
        handlebars.register_helper("random", Box::new(random_helper));

        // Output is YAML, not HTML
        handlebars.register_escape_fn(handlebars::no_escape);

        Self {
            handlebars,
            extension: extension.into(),
        }
    }

    /// Template file name for a request path.
    pub fn template_name(&self, path: &str) -> String {
        conventional_source(path, &self.extension)
    }

    /// Render the template for `path` with `context` as its variables.
    pub fn render(
        &self,
        catalog: &Catalog,
        path: &str,
        context: &BodyContext,
    ) -> Result<Rendered, RenderError> {
        let name = self.template_name(path);
        let source = catalog
            .template(&name)
            .ok_or_else(|| RenderError::TemplateNotFound { name: name.clone() })?;

        let document = self.expand(&name, source, context)?;
        let response = extract_response(&name, &document)?;

        Ok(Rendered {
            template: name,
            document,
            response,
        })
    }

    /// Expand a template string.
    pub fn expand(
        &self,
        name: &str,
        source: &str,
        context: &BodyContext,
    ) -> Result<String, RenderError> {
        self.handlebars
            .render_template(source, context)
            .map_err(|e| {
                let mut message = e.to_string();
                if let Some(key) = SHADOWING_BUILTINS
                    .iter()
                    .find(|key| context.get(key).is_some())
                {
                    message.push_str(&format!(
                        " (body key `{key}` is shadowed by a helper; use `{{{{this.{key}}}}}`)"
                    ));
                }
                RenderError::TemplateSyntax {
                    name: name.to_string(),
                    message,
                }
            })
    }
}

/// Parse an expanded document and pull out its `response` field as JSON.
pub fn extract_response(name: &str, document: &str) -> Result<Value, RenderError> {
    let parsed: YamlValue =
        serde_yaml::from_str(document).map_err(|e| RenderError::InvalidDocument {
            name: name.to_string(),
            message: e.to_string(),
        })?;

    let response = parsed
        .as_mapping()
        .and_then(|m| m.get(RESPONSE_FIELD))
        .ok_or_else(|| RenderError::MissingResponseField {
            name: name.to_string(),
        })?;

    serde_json::to_value(response).map_err(|e| RenderError::InvalidDocument {
        name: name.to_string(),
        message: e.to_string(),
    })
}

// Custom Handlebars helpers
//
// Every helper called bare (`{{name}}`, no parameters, no block) renders the
// body value of the same name when there is one. Body keys are top-level
// variables and must not disappear behind a helper.

fn body_variable<'a>(h: &Helper<'_>, ctx: &'a Context) -> Option<&'a Value> {
    if !h.params().is_empty() || !h.hash().is_empty() || h.template().is_some() {
        return None;
    }
    ctx.data().get(h.name())
}

fn write_body_variable(
    h: &Helper<'_>,
    ctx: &Context,
    out: &mut dyn Output,
) -> Result<bool, handlebars::RenderError> {
    match body_variable(h, ctx) {
        Some(value) => {
            out.write(&variable_text(value))?;
            Ok(true)
        }
        None => Ok(false),
    }
}

struct RawHelper;

impl HelperDef for RawHelper {
    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        r: &'reg Handlebars<'reg>,
        ctx: &'rc Context,
        rc: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> HelperResult {
        if write_body_variable(h, ctx, out)? {
            return Ok(());
        }
        match h.template() {
            Some(template) => template.render(r, ctx, rc, out),
            None => Ok(()),
        }
    }
}

struct LookupHelper;

impl HelperDef for LookupHelper {
    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        ctx: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
    ) -> Result<ScopedJson<'rc>, handlebars::RenderError> {
        if let Some(value) = body_variable(h, ctx) {
            return Ok(ScopedJson::Constant(value));
        }
        let collection = h
            .param(0)
            .ok_or(RenderErrorReason::ParamNotFoundForIndex("lookup", 0))?;
        let key = h
            .param(1)
            .ok_or(RenderErrorReason::ParamNotFoundForIndex("lookup", 1))?;

        let found = match (collection.value(), key.value()) {
            (Value::Object(map), Value::String(k)) => map.get(k),
            (Value::Array(items), Value::Number(n)) => {
                n.as_u64().and_then(|i| items.get(i as usize))
            }
            (Value::Array(items), Value::String(s)) => {
                s.parse::<usize>().ok().and_then(|i| items.get(i))
            }
            _ => None,
        };
        found
            .map(|v| ScopedJson::Derived(v.clone()))
            .ok_or_else(|| {
                RenderErrorReason::Other(format!("lookup found nothing at {}", key.value())).into()
            })
    }
}

struct LenHelper;

impl HelperDef for LenHelper {
    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        ctx: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
    ) -> Result<ScopedJson<'rc>, handlebars::RenderError> {
        if let Some(value) = body_variable(h, ctx) {
            return Ok(ScopedJson::Constant(value));
        }
        let value = h
            .param(0)
            .ok_or(RenderErrorReason::ParamNotFoundForIndex("len", 0))?;
        let len = match value.value() {
            Value::Array(items) => items.len(),
            Value::Object(map) => map.len(),
            Value::String(s) => s.chars().count(),
            _ => 0,
        };
        Ok(ScopedJson::Derived(Value::from(len)))
    }
}

fn log_helper(
    h: &Helper,
    _: &Handlebars,
    ctx: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    if write_body_variable(h, ctx, out)? {
        return Ok(());
    }
    let text = h
        .params()
        .iter()
        .map(|p| display_value(p.value()))
        .collect::<Vec<_>>()
        .join(" ");
    info!(text = %text, "Template log");
    Ok(())
}

fn json_helper(
    h: &Helper,
    _: &Handlebars,
    ctx: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    if write_body_variable(h, ctx, out)? {
        return Ok(());
    }
    let value = h
        .param(0)
        .ok_or(RenderErrorReason::ParamNotFoundForIndex("json", 0))?;
    // Compact JSON is valid YAML flow syntax
    let text = serde_json::to_string(value.value())
        .map_err(|e| RenderErrorReason::Other(e.to_string()))?;
    out.write(&text)?;
    Ok(())
}

fn upper_helper(
    h: &Helper,
    _: &Handlebars,
    ctx: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    if write_body_variable(h, ctx, out)? {
        return Ok(());
    }
    let value = h
        .param(0)
        .ok_or(RenderErrorReason::ParamNotFoundForIndex("upper", 0))?;
    out.write(&display_value(value.value()).to_uppercase())?;
    Ok(())
}

fn lower_helper(
    h: &Helper,
    _: &Handlebars,
    ctx: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    if write_body_variable(h, ctx, out)? {
        return Ok(());
    }
    let value = h
        .param(0)
        .ok_or(RenderErrorReason::ParamNotFoundForIndex("lower", 0))?;
    out.write(&display_value(value.value()).to_lowercase())?;
    Ok(())
}

fn now_helper(
    h: &Helper,
    _: &Handlebars,
    ctx: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    if write_body_variable(h, ctx, out)? {
        return Ok(());
    }
    let format = h
        .param(0)
        .and_then(|v| v.value().as_str())
        .unwrap_or("%Y-%m-%dT%H:%M:%S%.3fZ");

    out.write(&chrono::Utc::now().format(format).to_string())?;
    Ok(())
}

/// Random RFC 4122 version 4 identifier.
fn uuid_v4() -> String {
    let mut bits: u128 = rand::random();
    bits = (bits & !(0xf_u128 << 76)) | (0x4_u128 << 76);
    bits = (bits & !(0x3_u128 << 62)) | (0x2_u128 << 62);

    format!(
        "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
        bits >> 96,
        (bits >> 80) & 0xffff,
        (bits >> 64) & 0xffff,
        (bits >> 48) & 0xffff,
        bits & 0xffff_ffff_ffff,
    )
}

fn uuid_helper(
    h: &Helper,
    _: &Handlebars,
    ctx: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    if write_body_variable(h, ctx, out)? {
        return Ok(());
    }
    out.write(&uuid_v4())?;
    Ok(())
}

fn random_helper(
    h: &Helper,
    _: &Handlebars,
    ctx: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    use rand::Rng;

    if write_body_variable(h, ctx, out)? {
        return Ok(());
    }
    let a = h.param(0).and_then(|v| v.value().as_i64()).unwrap_or(0);
    let b = h.param(1).and_then(|v| v.value().as_i64()).unwrap_or(100);
    let (min, max) = if a <= b { (a, b) } else { (b, a) };

    let value = rand::thread_rng().gen_range(min..=max);
    out.write(&value.to_string())?;
    Ok(())
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// Same text a plain variable expression renders for `value`.
fn variable_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        other => display_value(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::BodyValue;
    use crate::catalog::MockDefinition;
    use axum::body::Bytes;
    use serde_json::json;

    fn catalog_with(path: &str, template: &str) -> Catalog {
        Catalog::from_definitions(vec![MockDefinition::at_conventional_source(
            path, "yml", template,
        )])
    }

    fn context(value: Value) -> BodyContext {
        match value {
            Value::Object(map) => BodyContext::from(map),
            _ => panic!("context must be an object"),
        }
    }

    #[test]
    fn test_static_template() {
        let engine = TemplateEngine::new("yml");
        let catalog = catalog_with("/ping", "path: /ping\nresponse: {status: ok}\n");

        let rendered = engine.render(&catalog, "/ping", &BodyContext::new()).unwrap();
        assert_eq!(rendered.template, "ping.yml");
        assert_eq!(rendered.response, json!({"status": "ok"}));
    }

    #[test]
    fn test_variable_substitution() {
        let engine = TemplateEngine::new("yml");
        let catalog = catalog_with("/echo", "path: /echo\nresponse: {got: {{ name }}}\n");

        let rendered = engine
            .render(&catalog, "/echo", &context(json!({"name": "alice"})))
            .unwrap();
        assert_eq!(rendered.document, "path: /echo\nresponse: {got: alice}\n");
        assert_eq!(rendered.response, json!({"got": "alice"}));
    }

    #[test]
    fn test_nested_variables_and_block_yaml() {
        let engine = TemplateEngine::new("yml");
        let template = "path: /users\nresponse:\n  city: \"{{address.city}}\"\n  first_tag: {{tags.[0]}}\n";
        let catalog = catalog_with("/users", template);

        let ctx = context(json!({"address": {"city": "Paris"}, "tags": ["admin", "ops"]}));
        let rendered = engine.render(&catalog, "/users", &ctx).unwrap();
        assert_eq!(rendered.response, json!({"city": "Paris", "first_tag": "admin"}));
    }

    #[test]
    fn test_no_html_escaping() {
        let engine = TemplateEngine::new("yml");
        let catalog = catalog_with("/q", "path: /q\nresponse:\n  q: \"{{ q }}\"\n");

        let rendered = engine
            .render(&catalog, "/q", &context(json!({"q": "a<b>&c"})))
            .unwrap();
        assert_eq!(rendered.response, json!({"q": "a<b>&c"}));
    }

    #[test]
    fn test_undefined_variable_fails() {
        let engine = TemplateEngine::new("yml");
        let catalog = catalog_with("/echo", "path: /echo\nresponse: {got: {{ name }}}\n");

        let err = engine
            .render(&catalog, "/echo", &BodyContext::new())
            .unwrap_err();
        assert!(matches!(err, RenderError::TemplateSyntax { .. }));
    }

    #[test]
    fn test_syntax_error_fails() {
        let engine = TemplateEngine::new("yml");
        let catalog = catalog_with("/bad", "path: /bad\nresponse: {{#if}}\n");

        let err = engine.render(&catalog, "/bad", &BodyContext::new()).unwrap_err();
        assert!(matches!(err, RenderError::TemplateSyntax { .. }));
    }

    #[test]
    fn test_missing_template_file() {
        let engine = TemplateEngine::new("yml");
        let catalog = Catalog::from_definitions(vec![MockDefinition::new(
            "/alias",
            "somewhere/else.yml",
            "path: /alias\nresponse: {}\n",
        )]);

        let err = engine.render(&catalog, "/alias", &BodyContext::new()).unwrap_err();
        match err {
            RenderError::TemplateNotFound { name } => assert_eq!(name, "alias.yml"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_template_extension_is_configurable() {
        let engine = TemplateEngine::new("yaml");
        assert_eq!(engine.template_name("/a/b"), "a/b.yaml");

        let catalog = Catalog::from_definitions(vec![MockDefinition::at_conventional_source(
            "/a/b",
            "yaml",
            "path: /a/b\nresponse: 1\n",
        )]);
        let rendered = engine.render(&catalog, "/a/b", &BodyContext::new()).unwrap();
        assert_eq!(rendered.response, json!(1));
    }

    #[test]
    fn test_missing_response_field() {
        let engine = TemplateEngine::new("yml");
        let catalog = catalog_with("/nothing", "path: /nothing\nbody: {status: ok}\n");

        let err = engine.render(&catalog, "/nothing", &BodyContext::new()).unwrap_err();
        assert!(matches!(err, RenderError::MissingResponseField { .. }));
    }

    #[test]
    fn test_expansion_producing_invalid_yaml() {
        let engine = TemplateEngine::new("yml");
        let catalog = catalog_with("/broken", "path: /broken\nresponse: {{ raw }}\n");

        let err = engine
            .render(&catalog, "/broken", &context(json!({"raw": "[unclosed"})))
            .unwrap_err();
        assert!(matches!(err, RenderError::InvalidDocument { .. }));
    }

    #[test]
    fn test_extract_response_non_mapping() {
        let err = extract_response("list.yml", "- a\n- b\n").unwrap_err();
        assert!(matches!(err, RenderError::MissingResponseField { .. }));
    }

    #[test]
    fn test_null_response_is_returned() {
        let value = extract_response("null.yml", "response: null\n").unwrap();
        assert_eq!(value, Value::Null);
    }

    #[test]
    fn test_json_helper_embeds_structures() {
        let engine = TemplateEngine::new("yml");
        let catalog = catalog_with("/json", "path: /json\nresponse:\n  echo: {{json user}}\n");

        let user = json!({"name": "alice", "roles": ["admin"], "age": 30});
        let rendered = engine
            .render(&catalog, "/json", &context(json!({"user": user.clone()})))
            .unwrap();
        assert_eq!(rendered.response, json!({"echo": user}));
    }

    #[test]
    fn test_upper_lower_helpers() {
        let engine = TemplateEngine::new("yml");
        let catalog = catalog_with(
            "/case",
            "path: /case\nresponse:\n  up: {{upper name}}\n  down: {{lower name}}\n",
        );

        let rendered = engine
            .render(&catalog, "/case", &context(json!({"name": "John"})))
            .unwrap();
        assert_eq!(rendered.response, json!({"up": "JOHN", "down": "john"}));
    }

    #[test]
    fn test_uuid_helper() {
        let engine = TemplateEngine::new("yml");
        let expanded = engine
            .expand("t", "ID: {{uuid}}", &BodyContext::new())
            .unwrap();

        // UUID format: xxxxxxxx-xxxx-4xxx-[89ab]xxx-xxxxxxxxxxxx
        let uuid = expanded.strip_prefix("ID: ").unwrap();
        assert_eq!(uuid.len(), 36);
        let groups: Vec<&str> = uuid.split('-').collect();
        assert_eq!(
            groups.iter().map(|g| g.len()).collect::<Vec<_>>(),
            vec![8, 4, 4, 4, 12]
        );
        assert!(groups[2].starts_with('4'));
        assert!(matches!(groups[3].chars().next(), Some('8' | '9' | 'a' | 'b')));
        assert!(uuid.chars().all(|c| c == '-' || c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_body_keys_named_like_helpers_are_substituted() {
        let engine = TemplateEngine::new("yml");
        let ctx = context(json!({
            "raw": "r", "log": "l", "lookup": "lk", "len": 7,
            "json": "j", "upper": "u", "lower": "lo", "now": "n",
            "uuid": "id-1", "random": 4
        }));

        let expanded = engine
            .expand(
                "t",
                "{{raw}} {{log}} {{lookup}} {{len}} {{json}} {{upper}} {{lower}} {{now}} {{uuid}} {{random}}",
                &ctx,
            )
            .unwrap();
        assert_eq!(expanded, "r l lk 7 j u lo n id-1 4");
    }

    #[test]
    fn test_helpers_still_work_next_to_same_named_keys() {
        let engine = TemplateEngine::new("yml");
        let ctx = context(json!({"len": "x", "upper": "y", "tags": ["a", "b", "c"], "name": "bo"}));

        let expanded = engine
            .expand("t", "{{len tags}} {{upper name}} {{lookup tags 1}}", &ctx)
            .unwrap();
        assert_eq!(expanded, "3 BO b");
    }

    #[test]
    fn test_raw_block_still_renders_verbatim() {
        let engine = TemplateEngine::new("yml");
        let expanded = engine
            .expand("t", "{{{{raw}}}}{{ name }}{{{{/raw}}}}", &BodyContext::new())
            .unwrap();
        assert_eq!(expanded, "{{ name }}");
    }

    #[test]
    fn test_shadowed_builtin_fails_loudly() {
        let engine = TemplateEngine::new("yml");
        let catalog = catalog_with("/cmp", "path: /cmp
response: {{ eq }}
");

        let err = engine
            .render(&catalog, "/cmp", &context(json!({"eq": "same"})))
            .unwrap_err();
        match err {
            RenderError::TemplateSyntax { message, .. } => {
                assert!(message.contains("{{this.eq}}"), "{message}")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_lookup_missing_key_fails() {
        let engine = TemplateEngine::new("yml");
        let ctx = context(json!({"user": {"name": "alice"}}));

        let err = engine
            .expand("t", "{{lookup user \"age\"}}", &ctx)
            .unwrap_err();
        assert!(matches!(err, RenderError::TemplateSyntax { .. }));
    }

    #[test]
    fn test_random_helper_stays_in_range() {
        let engine = TemplateEngine::new("yml");
        for _ in 0..20 {
            let expanded = engine
                .expand("t", "{{random 5 10}}", &BodyContext::new())
                .unwrap();
            let n: i64 = expanded.parse().unwrap();
            assert!((5..=10).contains(&n));
        }
    }

    #[test]
    fn test_now_helper_format() {
        let engine = TemplateEngine::new("yml");
        let expanded = engine
            .expand("t", "{{now \"%Y\"}}", &BodyContext::new())
            .unwrap();
        assert_eq!(expanded.len(), 4);
        assert!(expanded.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_uploaded_bytes_render_as_text() {
        let engine = TemplateEngine::new("yml");
        let mut ctx = BodyContext::new();
        ctx.insert("file", BodyValue::Bytes(Bytes::from_static(b"hello")));

        let expanded = engine.expand("t", "{{file}}", &ctx).unwrap();
        assert_eq!(expanded, "hello");
    }
}
