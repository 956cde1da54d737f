//! JSON schema loading and credential subject validation.

use crate::cache::Cache;
use crate::ClaimsError;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// A credential JSON schema and the JSON-LD context it points to.
#[derive(Debug, Clone)]
pub struct Schema {
    pub url: String,
    pub document: Value,
}

impl Schema {
    /// Parses a schema document.
    ///
    /// # Errors
    ///
    /// [`ClaimsError::Schema`] when the body is not JSON or has no
    /// `$metadata.uris.jsonLdContext`.
    pub fn parse(url: &str, body: &str) -> Result<Self, ClaimsError> {
        let document: Value = serde_json::from_str(body)
            .map_err(|e| ClaimsError::Schema(format!("{url} is not JSON: {e}")))?;
        let schema = Self {
            url: url.to_string(),
            document,
        };
        schema.ld_context()?;
        Ok(schema)
    }

    /// `$metadata.uris.jsonLdContext`.
    ///
    /// # Errors
    ///
    /// [`ClaimsError::Schema`] when the schema does not name one.
    pub fn ld_context(&self) -> Result<&str, ClaimsError> {
        self.document
            .pointer("/$metadata/uris/jsonLdContext")
            .and_then(Value::as_str)
            .ok_or_else(|| ClaimsError::Schema(format!("{} has no jsonLdContext", self.url)))
    }

    /// `$metadata.type`, when the schema declares one.
    pub fn declared_type(&self) -> Option<&str> {
        self.document.pointer("/$metadata/type").and_then(Value::as_str)
    }

    /// Rejects a requested type that differs from the declared one.
    ///
    /// # Errors
    ///
    /// [`ClaimsError::Schema`] on mismatch.
    pub fn check_type(&self, requested: &str) -> Result<(), ClaimsError> {
        match self.declared_type() {
            Some(declared) if declared != requested => Err(ClaimsError::Schema(format!(
                "schema {} describes {declared}, not {requested}",
                self.url
            ))),
            _ => Ok(()),
        }
    }

    /// Validates `subject` against `properties.credentialSubject`.
    ///
    /// Covers the type, enum and const keywords, numeric bounds, string
    /// length, `pattern` and `format`, array and object size, `items`,
    /// `additionalProperties` and the `allOf` / `anyOf` / `oneOf` / `not`
    /// combinators, descending into nested values. `$ref` is not followed.
    /// Required keys listed in `optional` may be missing, which lets link
    /// templates omit `id`.
    ///
    /// # Errors
    ///
    /// [`ClaimsError::Schema`] naming the first offending field.
    pub fn validate_subject(
        &self,
        subject: &Map<String, Value>,
        optional: &[&str],
    ) -> Result<(), ClaimsError> {
        let Some(rules) = self.document.pointer("/properties/credentialSubject") else {
            return Ok(());
        };
        validate_value(
            rules,
            &Value::Object(subject.clone()),
            "credentialSubject",
            optional,
        )
    }
}

fn schema_error(path: &str, detail: impl std::fmt::Display) -> ClaimsError {
    ClaimsError::Schema(format!("{path}: {detail}"))
}

fn validate_value(
    rule: &Value,
    value: &Value,
    path: &str,
    optional: &[&str],
) -> Result<(), ClaimsError> {
    if let Some(types) = rule.get("type") {
        let allowed: Vec<&str> = match types {
            Value::String(t) => vec![t.as_str()],
            Value::Array(ts) => ts.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        if !allowed.is_empty() && !allowed.iter().any(|t| has_type(value, t)) {
            return Err(schema_error(path, format!("expected {}", allowed.join(" or "))));
        }
    }
    if let Some(options) = rule.get("enum").and_then(Value::as_array) {
        if !options.contains(value) {
            return Err(schema_error(path, "value not in enum"));
        }
    }
    if let Some(expected) = rule.get("const") {
        if expected != value {
            return Err(schema_error(path, format!("must equal {expected}")));
        }
    }
    validate_combinators(rule, value, path)?;
    match value {
        Value::Number(_) => validate_number(rule, value, path),
        Value::String(text) => validate_string(rule, text, path),
        Value::Array(items) => validate_array(rule, items, path),
        Value::Object(object) => validate_object(rule, object, path, optional),
        _ => Ok(()),
    }
}

fn validate_combinators(rule: &Value, value: &Value, path: &str) -> Result<(), ClaimsError> {
    let branches = |key: &str| {
        rule.get(key)
            .and_then(Value::as_array)
            .map(|all| all.iter().filter(|b| validate_value(b, value, path, &[]).is_ok()).count())
    };
    if let Some(all) = rule.get("allOf").and_then(Value::as_array) {
        for branch in all {
            validate_value(branch, value, path, &[])?;
        }
    }
    if branches("anyOf") == Some(0) {
        return Err(schema_error(path, "matches none of anyOf"));
    }
    if let Some(matched) = branches("oneOf") {
        if matched != 1 {
            return Err(schema_error(path, format!("matches {matched} oneOf branches")));
        }
    }
    if let Some(not) = rule.get("not") {
        if validate_value(not, value, path, &[]).is_ok() {
            return Err(schema_error(path, "matches a forbidden schema"));
        }
    }
    Ok(())
}

fn validate_number(rule: &Value, value: &Value, path: &str) -> Result<(), ClaimsError> {
    let Some(n) = value.as_f64() else {
        return Ok(());
    };
    let bound = |key: &str| rule.get(key).and_then(Value::as_f64);
    if let Some(min) = bound("minimum") {
        if n < min {
            return Err(schema_error(path, format!("below minimum {min}")));
        }
    }
    if let Some(max) = bound("maximum") {
        if n > max {
            return Err(schema_error(path, format!("above maximum {max}")));
        }
    }
    if let Some(min) = bound("exclusiveMinimum") {
        if n <= min {
            return Err(schema_error(path, format!("must exceed {min}")));
        }
    }
    if let Some(max) = bound("exclusiveMaximum") {
        if n >= max {
            return Err(schema_error(path, format!("must be below {max}")));
        }
    }
    if let Some(step) = bound("multipleOf").filter(|step| *step > 0.0) {
        if (n / step).fract() != 0.0 {
            return Err(schema_error(path, format!("not a multiple of {step}")));
        }
    }
    Ok(())
}

fn validate_string(rule: &Value, text: &str, path: &str) -> Result<(), ClaimsError> {
    let chars = text.chars().count() as u64;
    if let Some(min) = rule.get("minLength").and_then(Value::as_u64) {
        if chars < min {
            return Err(schema_error(path, format!("shorter than {min}")));
        }
    }
    if let Some(max) = rule.get("maxLength").and_then(Value::as_u64) {
        if chars > max {
            return Err(schema_error(path, format!("longer than {max}")));
        }
    }
    if let Some(pattern) = rule.get("pattern").and_then(Value::as_str) {
        let re = Regex::new(pattern)
            .map_err(|e| schema_error(path, format!("bad pattern {pattern}: {e}")))?;
        if !re.is_match(text) {
            return Err(schema_error(path, format!("does not match {pattern}")));
        }
    }
    if let Some(format) = rule.get("format").and_then(Value::as_str) {
        if !has_format(text, format) {
            return Err(schema_error(path, format!("not a valid {format}")));
        }
    }
    Ok(())
}

fn has_format(text: &str, format: &str) -> bool {
    match format {
        "date-time" => chrono::DateTime::parse_from_rfc3339(text).is_ok(),
        "date" => chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d").is_ok(),
        "time" => chrono::NaiveTime::parse_from_str(text.trim_end_matches('Z'), "%H:%M:%S%.f")
            .is_ok(),
        "email" => text.split_once('@').is_some_and(|(local, domain)| {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !text.contains(char::is_whitespace)
        }),
        "uri" => uri_scheme().is_some_and(|re| re.is_match(text)),
        "uuid" => uuid::Uuid::parse_str(text).is_ok(),
        // Unknown formats are annotations only.
        _ => true,
    }
}

fn uri_scheme() -> Option<&'static Regex> {
    static URI: OnceLock<Option<Regex>> = OnceLock::new();
    URI.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*:[^\s]+$").ok())
        .as_ref()
}

fn validate_array(rule: &Value, items: &[Value], path: &str) -> Result<(), ClaimsError> {
    let len = items.len() as u64;
    if let Some(min) = rule.get("minItems").and_then(Value::as_u64) {
        if len < min {
            return Err(schema_error(path, format!("fewer than {min} items")));
        }
    }
    if let Some(max) = rule.get("maxItems").and_then(Value::as_u64) {
        if len > max {
            return Err(schema_error(path, format!("more than {max} items")));
        }
    }
    if rule.get("uniqueItems").and_then(Value::as_bool) == Some(true) {
        for (i, item) in items.iter().enumerate() {
            if items[..i].contains(item) {
                return Err(schema_error(path, "items are not unique"));
            }
        }
    }
    if let Some(each) = rule.get("items").filter(|r| r.is_object()) {
        for (i, item) in items.iter().enumerate() {
            validate_value(each, item, &format!("{path}.{i}"), &[])?;
        }
    }
    Ok(())
}

fn validate_object(
    rule: &Value,
    object: &Map<String, Value>,
    path: &str,
    optional: &[&str],
) -> Result<(), ClaimsError> {
    if let Some(required) = rule.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(name) && !optional.contains(&name) {
                return Err(ClaimsError::Schema(format!("{path}.{name} is required")));
            }
        }
    }
    let len = object.len() as u64;
    if let Some(min) = rule.get("minProperties").and_then(Value::as_u64) {
        if len < min {
            return Err(schema_error(path, format!("fewer than {min} properties")));
        }
    }
    if let Some(max) = rule.get("maxProperties").and_then(Value::as_u64) {
        if len > max {
            return Err(schema_error(path, format!("more than {max} properties")));
        }
    }
    let properties = rule.get("properties").and_then(Value::as_object);
    let additional = rule.get("additionalProperties");
    for (name, value) in object {
        let field = format!("{path}.{name}");
        match (properties.and_then(|p| p.get(name)), additional) {
            (Some(inner), _) => validate_value(inner, value, &field, &[])?,
            (None, Some(Value::Bool(false))) => {
                return Err(ClaimsError::Schema(format!("{field} is not allowed")));
            }
            (None, Some(extra)) if extra.is_object() => {
                validate_value(extra, value, &field, &[])?;
            }
            (None, _) => {}
        }
    }
    Ok(())
}

fn has_type(value: &Value, name: &str) -> bool {
    match name {
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        "number" => value.is_number(),
        "integer" => {
            value.is_i64() || value.is_u64() || value.as_f64().is_some_and(|f| f.fract() == 0.0)
        }
        _ => true,
    }
}

/// Fetches schemas over HTTP(S) or IPFS, through a cache.
pub struct SchemaLoader {
    client: reqwest::Client,
    ipfs_gateway: Option<String>,
    cache: Arc<dyn Cache>,
    ttl: Duration,
}

impl SchemaLoader {
    /// # Errors
    ///
    /// [`ClaimsError::Http`] when the HTTP client cannot be built.
    pub fn new(cache: Arc<dyn Cache>, ttl: Duration, timeout: Duration) -> Result<Self, ClaimsError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClaimsError::Http(e.to_string()))?;
        Ok(Self {
            client,
            ipfs_gateway: None,
            cache,
            ttl,
        })
    }

    pub fn with_ipfs_gateway(mut self, gateway: impl Into<String>) -> Self {
        self.ipfs_gateway = Some(gateway.into().trim_end_matches('/').to_string());
        self
    }

    /// The HTTP URL a schema URL is fetched from.
    ///
    /// # Errors
    ///
    /// [`ClaimsError::InvalidRequest`] for unsupported schemes or an
    /// `ipfs://` URL without a configured gateway.
    pub fn fetch_url(&self, url: &str) -> Result<String, ClaimsError> {
        if let Some(cid) = url.strip_prefix("ipfs://") {
            let gateway = self.ipfs_gateway.as_deref().ok_or_else(|| {
                ClaimsError::InvalidRequest(format!("no IPFS gateway configured for {url}"))
            })?;
            return Ok(format!("{gateway}/ipfs/{cid}"));
        }
        if url.starts_with("https://") || url.starts_with("http://") {
            return Ok(url.to_string());
        }
        Err(ClaimsError::InvalidRequest(format!("unsupported schema url {url}")))
    }

    /// Loads and parses the schema at `url`.
    ///
    /// # Errors
    ///
    /// [`ClaimsError::Http`] when the fetch fails, [`ClaimsError::Schema`]
    /// for a non-success status or an unusable document.
    pub async fn load(&self, url: &str) -> Result<Schema, ClaimsError> {
        if let Some(body) = self.cache.get(url).await {
            match Schema::parse(url, &body) {
                Ok(schema) => return Ok(schema),
                Err(e) => tracing::warn!(url, "discarding cached schema: {}", e),
            }
        }

        let target = self.fetch_url(url)?;
        tracing::debug!(url, target = %target, "fetching schema");
        let response = self
            .client
            .get(&target)
            .send()
            .await
            .map_err(|e| ClaimsError::Http(format!("{target}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClaimsError::Schema(format!("{target} answered {status}")));
        }
        let body = response
            .text()
            .await
            .map_err(|e| ClaimsError::Http(format!("{target}: {e}")))?;
        let schema = Schema::parse(url, &body)?;
        self.cache.set(url, &body, self.ttl).await;
        Ok(schema)
    }
}
