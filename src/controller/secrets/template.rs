//! # Secret Templates
//!
//! Renders a user supplied Secret manifest from binding credentials.
//!
//! The environment is sandboxed: there is no template loader (no filesystem
//! access), no access to process environment, undefined variables are errors,
//! and only the filters and functions registered below exist. Output is
//! capped at [`TEMPLATE_OUTPUT_MAX_BYTES`] while it is written, and template
//! execution at [`TEMPLATE_FUEL`] instructions.
//!
//! Variables:
//!
//! - `credentials` - the remote credential document
//! - `instance` - `instance_name`, `instance_guid`, `plan`, `label`, `type`, `tags`

use super::{InstanceInfo, SecretContent, SecretError};
use crate::constants::TEMPLATE_OUTPUT_MAX_BYTES;
use base64::{engine::general_purpose::STANDARD, Engine};
use minijinja::{Environment, Error, ErrorKind, UndefinedBehavior, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io;

/// Instruction budget of a single render
pub const TEMPLATE_FUEL: u64 = 100_000;

/// Collects rendered output and fails once `limit` would be exceeded
#[derive(Debug)]
struct CappedWriter {
    buf: Vec<u8>,
    limit: usize,
    overflowed: bool,
}

impl CappedWriter {
    fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            overflowed: false,
        }
    }
}

impl io::Write for CappedWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.buf.len() + data.len() > self.limit {
            self.overflowed = true;
            return Err(io::Error::other("template output limit reached"));
        }
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn invalid_operation(message: String) -> Error {
    Error::new(ErrorKind::InvalidOperation, message)
}

/// `{{ value | b64enc }}`
fn b64enc(value: &str) -> String {
    STANDARD.encode(value.as_bytes())
}

/// `{{ value | b64dec }}`
fn b64dec(value: &str) -> Result<String, Error> {
    let bytes = STANDARD
        .decode(value)
        .map_err(|e| invalid_operation(format!("base64 decode error: {e}")))?;
    String::from_utf8(bytes)
        .map_err(|e| invalid_operation(format!("base64 decode produced invalid UTF-8: {e}")))
}

fn sha256sum(value: &str) -> String {
    format!("{:x}", Sha256::digest(value.as_bytes()))
}

fn to_json(value: Value) -> Result<String, Error> {
    serde_json::to_string(&value).map_err(|e| invalid_operation(format!("to_json: {e}")))
}

fn default_filter(value: Value, fallback: Value) -> Value {
    if value.is_undefined() || value.is_none() {
        fallback
    } else {
        value
    }
}

/// Reformat an RFC 3339 timestamp with a `strftime` pattern
fn date(value: &str, format: &str) -> Result<String, Error> {
    let parsed = chrono::DateTime::parse_from_rfc3339(value)
        .map_err(|e| invalid_operation(format!("date: {value} is not an RFC 3339 time: {e}")))?;
    Ok(parsed.format(format).to_string())
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

fn environment() -> Environment<'static> {
    let mut env = Environment::empty();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_fuel(Some(TEMPLATE_FUEL));

    env.add_filter("b64enc", b64enc);
    env.add_filter("b64dec", b64dec);
    env.add_filter("sha256sum", sha256sum);
    env.add_filter("to_json", to_json);
    env.add_filter("default", default_filter);
    env.add_filter("date", date);
    env.add_filter("upper", |v: &str| v.to_uppercase());
    env.add_filter("lower", |v: &str| v.to_lowercase());
    env.add_filter("trim", |v: &str| v.trim().to_string());
    env.add_filter("replace", |v: &str, from: &str, to: &str| v.replace(from, to));
    env.add_filter("quote", |v: &str| format!("{v:?}"));
    env.add_function("now", now);
    env
}

/// Render `template` and decode it into secret content
///
/// The result must be a single `v1` `Secret` whose metadata holds only
/// labels and annotations. Content with no `data`/`stringData` comes back
/// with an empty `data` map; the caller decides on a fallback.
pub fn render_secret_template(
    template: &str,
    credentials: &serde_json::Value,
    instance: &InstanceInfo,
) -> Result<SecretContent, SecretError> {
    let context = serde_json::json!({
        "credentials": credentials,
        "instance": instance.template_value(),
    });
    let env = environment();
    let compiled = env
        .template_from_str(template)
        .map_err(|e| SecretError::Invalid(format!("failed to parse secret template: {e}")))?;
    let mut out = CappedWriter::new(TEMPLATE_OUTPUT_MAX_BYTES);
    if let Err(e) = compiled.render_to_write(context, &mut out) {
        return Err(SecretError::Invalid(if out.overflowed {
            format!("rendered secret template exceeds {TEMPLATE_OUTPUT_MAX_BYTES} bytes")
        } else {
            format!("failed to render secret template: {e}")
        }));
    }
    let rendered = String::from_utf8(out.buf)
        .map_err(|e| SecretError::Invalid(format!("rendered secret template is not UTF-8: {e}")))?;
    parse_rendered_secret(&rendered)
}

fn string_map(
    value: Option<&serde_json::Value>,
    field: &str,
) -> Result<BTreeMap<String, String>, SecretError> {
    let Some(value) = value.filter(|v| !v.is_null()) else {
        return Ok(BTreeMap::new());
    };
    let fields = value
        .as_object()
        .ok_or_else(|| SecretError::Invalid(format!("{field} must be a map")))?;
    fields
        .iter()
        .map(|(k, v)| match v {
            serde_json::Value::String(s) => Ok((k.clone(), s.clone())),
            serde_json::Value::Number(_) | serde_json::Value::Bool(_) => {
                Ok((k.clone(), v.to_string()))
            }
            _ => Err(SecretError::Invalid(format!("{field}.{k} must be a string"))),
        })
        .collect()
}

/// Decode a rendered manifest into secret content
pub fn parse_rendered_secret(rendered: &str) -> Result<SecretContent, SecretError> {
    let doc: serde_json::Value = serde_yaml::from_str(rendered).map_err(|e| {
        SecretError::Invalid(format!("rendered secret template is not a single YAML object: {e}"))
    })?;
    let manifest = doc.as_object().ok_or_else(|| {
        SecretError::Invalid("rendered secret template must be a single Secret object".to_string())
    })?;

    if manifest.get("kind").and_then(|k| k.as_str()) != Some("Secret") {
        return Err(SecretError::Invalid(
            "rendered secret template must have kind Secret".to_string(),
        ));
    }
    if let Some(api_version) = manifest.get("apiVersion") {
        if api_version.as_str() != Some("v1") {
            return Err(SecretError::Invalid(format!(
                "rendered secret template has unsupported apiVersion {api_version}"
            )));
        }
    }

    let mut content = SecretContent::default();
    if let Some(metadata) = manifest.get("metadata").filter(|m| !m.is_null()) {
        let fields = metadata.as_object().ok_or_else(|| {
            SecretError::Invalid("metadata of the rendered secret must be a map".to_string())
        })?;
        if let Some(key) = fields
            .keys()
            .find(|k| *k != "labels" && *k != "annotations")
        {
            return Err(SecretError::Invalid(format!(
                "metadata.{key} is not allowed in a secret template, only labels and annotations"
            )));
        }
        content.labels = string_map(fields.get("labels"), "metadata.labels")?;
        content.annotations = string_map(fields.get("annotations"), "metadata.annotations")?;
    }

    for (key, encoded) in string_map(manifest.get("data"), "data")? {
        let bytes = STANDARD.decode(encoded.trim()).map_err(|e| {
            SecretError::Invalid(format!("data.{key} is not valid base64: {e}"))
        })?;
        content.data.insert(key, bytes);
    }
    for (key, value) in string_map(manifest.get("stringData"), "stringData")? {
        content.data.insert(key, value.into_bytes());
    }
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> InstanceInfo {
        InstanceInfo {
            instance_name: "orders-db".to_string(),
            instance_guid: "instance-1".to_string(),
            plan: "small".to_string(),
            offering: "mongo".to_string(),
            tags: vec!["mongo".to_string()],
        }
    }

    fn credentials() -> serde_json::Value {
        serde_json::json!({"username": "admin", "password": "s3cr3t", "port": 27017})
    }

    #[test]
    fn test_renders_string_data_with_filters() {
        let template = r#"
apiVersion: v1
kind: Secret
metadata:
  labels:
    plan: {{ instance.plan }}
stringData:
  url: "mongodb://{{ credentials.username }}:{{ credentials.password }}@db:{{ credentials.port }}"
  user: {{ credentials.username | upper }}
data:
  password: {{ credentials.password | b64enc }}
"#;
        let content = render_secret_template(template, &credentials(), &instance()).unwrap();
        assert_eq!(content.data["url"], b"mongodb://admin:s3cr3t@db:27017");
        assert_eq!(content.data["user"], b"ADMIN");
        assert_eq!(content.data["password"], b"s3cr3t");
        assert_eq!(content.labels["plan"], "small");
    }

    #[test]
    fn test_undefined_variable_is_an_error() {
        let template = "kind: Secret\nstringData:\n  x: {{ credentials.missing }}\n";
        let err = render_secret_template(template, &credentials(), &instance()).unwrap_err();
        assert!(matches!(err, SecretError::Invalid(_)));
    }

    #[test]
    fn test_environment_access_is_not_available() {
        let template = "kind: Secret\nstringData:\n  x: {{ env('HOME') }}\n";
        assert!(render_secret_template(template, &credentials(), &instance()).is_err());
    }

    #[test]
    fn test_metadata_beyond_labels_and_annotations_is_rejected() {
        let err = parse_rendered_secret("kind: Secret\nmetadata:\n  name: other\n").unwrap_err();
        assert!(err.to_string().contains("metadata.name"));
    }

    #[test]
    fn test_wrong_kind_and_multiple_documents_are_rejected() {
        assert!(parse_rendered_secret("kind: ConfigMap\ndata: {}\n").is_err());
        assert!(parse_rendered_secret("kind: Secret\n---\nkind: Secret\n").is_err());
    }

    #[test]
    fn test_output_size_is_bounded() {
        let blob = "x".repeat(TEMPLATE_OUTPUT_MAX_BYTES + 1);
        let template = "kind: Secret\nstringData:\n  x: {{ credentials.blob }}\n";
        let err = render_secret_template(template, &serde_json::json!({"blob": blob}), &instance())
            .unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn test_output_is_capped_while_rendering() {
        let chunk = "y".repeat(64 * 1024);
        let template = "kind: Secret\nstringData:\n  x: \"{% for _ in range(1000) %}{{ credentials.chunk }}{% endfor %}\"\n";
        let err = render_secret_template(template, &serde_json::json!({"chunk": chunk}), &instance())
            .unwrap_err();
        assert!(err.to_string().contains("exceeds"), "{err}");
    }

    #[test]
    fn test_runaway_loops_run_out_of_fuel() {
        let template = "kind: Secret\nstringData:\n  x: \"{% for a in range(10000) %}{% for b in range(10000) %}{% endfor %}{% endfor %}\"\n";
        let err = render_secret_template(template, &credentials(), &instance()).unwrap_err();
        assert!(matches!(err, SecretError::Invalid(_)));
        assert!(!err.to_string().contains("exceeds"), "{err}");
    }

    #[test]
    fn test_manifest_without_data_yields_empty_content() {
        let content =
            parse_rendered_secret("kind: Secret\nmetadata:\n  annotations:\n    a: b\n").unwrap();
        assert!(content.data.is_empty());
        assert_eq!(content.annotations["a"], "b");
    }
}
