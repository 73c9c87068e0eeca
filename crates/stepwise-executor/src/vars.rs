//! Build variables and credential redaction.
//!
//! Values reference variables as `((name))`, `((name.field))`, or
//! `((.:name))` to insist on a locally bound variable. Local scopes are
//! consulted first, then the credential manager behind [`Secrets`].
//! Every credential fetched this way is remembered by the build's
//! [`RedactionTracker`] so output writers can mask it.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// What redacted text is replaced with
pub const REDACTED: &str = "((redacted))";

static REFERENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(\(([^()\s]+)\)\)").expect("valid variable reference pattern"));

/// Variable resolution errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VarsError {
    /// Nothing is bound to the referenced name
    #[error("undefined vars: {reference}")]
    Undefined {
        /// The reference as written
        reference: String,
    },

    /// The variable exists but has no such field
    #[error("cannot access field '{field}' of var '{reference}'")]
    MissingField {
        /// The reference as written
        reference: String,
        /// The missing field
        field: String,
    },

    /// The credential manager failed
    #[error("failed to fetch credential '{name}': {reason}")]
    Secrets {
        /// Variable name
        name: String,
        /// Underlying failure
        reason: String,
    },
}

/// A parsed `((...))` reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarRef {
    /// Only locally bound variables may satisfy it
    pub local_only: bool,
    /// Variable name
    pub name: String,
    /// Field path into the variable's value
    pub fields: Vec<String>,
    raw: String,
}

impl VarRef {
    /// Parses the text between the parentheses
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let (local_only, path) = match raw.strip_prefix(".:") {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        let mut parts = path.split('.').map(str::to_string);
        let name = parts.next().unwrap_or_default();
        Self {
            local_only,
            name,
            fields: parts.collect(),
            raw: raw.to_string(),
        }
    }
}

impl fmt::Display for VarRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// The credential manager
pub trait Secrets: fmt::Debug + Send + Sync {
    /// Fetches a credential by name
    ///
    /// # Errors
    ///
    /// Returns [`VarsError::Secrets`] when the backend fails. A missing
    /// credential is `Ok(None)`.
    fn get(&self, name: &str) -> Result<Option<Value>, VarsError>;
}

/// Credentials from a fixed map
#[derive(Debug, Clone, Default)]
pub struct StaticSecrets {
    values: HashMap<String, Value>,
}

impl StaticSecrets {
    /// No credentials
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a credential
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }
}

impl Secrets for StaticSecrets {
    fn get(&self, name: &str) -> Result<Option<Value>, VarsError> {
        Ok(self.values.get(name).cloned())
    }
}

/// Values that must not appear in build output
#[derive(Debug)]
pub struct RedactionTracker {
    enabled: bool,
    values: RwLock<HashSet<String>>,
}

impl RedactionTracker {
    /// Creates a tracker; a disabled tracker remembers nothing
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            values: RwLock::default(),
        }
    }

    /// Whether redaction is enabled
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Remembers every string inside `value`
    pub fn track(&self, value: &Value) {
        if !self.enabled {
            return;
        }
        match value {
            Value::String(s) => {
                self.values.write().insert(s.clone());
            }
            Value::Array(items) => items.iter().for_each(|item| self.track(item)),
            Value::Object(fields) => fields.values().for_each(|field| self.track(field)),
            Value::Null | Value::Bool(_) | Value::Number(_) => {}
        }
    }

    /// Replaces every tracked value in `text`.
    ///
    /// Multi-line values are matched line by line with surrounding
    /// whitespace trimmed. Lines of a single character are left alone.
    #[must_use]
    pub fn redact(&self, text: &str) -> String {
        let mut needles: Vec<String> = self
            .values
            .read()
            .iter()
            .flat_map(|value| value.split('\n').map(|line| line.trim().to_string()).collect::<Vec<_>>())
            .filter(|line| line.chars().count() > 1)
            .collect();
        if needles.is_empty() {
            return text.to_string();
        }
        needles.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        needles.dedup();

        let mut redacted = text.to_string();
        for needle in &needles {
            redacted = redacted.replace(needle.as_str(), REDACTED);
        }
        redacted
    }
}

/// Variables visible to a step
#[derive(Debug)]
pub struct BuildVariables {
    local: RwLock<HashMap<String, Value>>,
    parent: Option<Arc<BuildVariables>>,
    secrets: Arc<dyn Secrets>,
    tracker: Arc<RedactionTracker>,
}

impl BuildVariables {
    /// Creates a build's root scope
    #[must_use]
    pub fn new(secrets: Arc<dyn Secrets>, redact: bool) -> Self {
        Self {
            local: RwLock::default(),
            parent: None,
            secrets,
            tracker: Arc::new(RedactionTracker::new(redact)),
        }
    }

    /// Creates a scope whose bindings shadow `self`'s and vanish with it
    #[must_use]
    pub fn new_local_scope(self: &Arc<Self>) -> Arc<Self> {
        Arc::new(Self {
            local: RwLock::default(),
            parent: Some(Arc::clone(self)),
            secrets: Arc::clone(&self.secrets),
            tracker: Arc::clone(&self.tracker),
        })
    }

    /// The build-wide redaction tracker
    #[must_use]
    pub fn tracker(&self) -> &Arc<RedactionTracker> {
        &self.tracker
    }

    /// Binds a local variable in this scope
    pub fn set_local(&self, name: impl Into<String>, value: Value, redact: bool) {
        if redact {
            self.tracker.track(&value);
        }
        self.local.write().insert(name.into(), value);
    }

    /// A locally bound variable, from this scope or an enclosing one
    #[must_use]
    pub fn local(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.local.read().get(name) {
            return Some(value.clone());
        }
        self.parent.as_ref().and_then(|parent| parent.local(name))
    }

    /// Resolves a reference
    ///
    /// # Errors
    ///
    /// Fails when nothing is bound, a field is missing, or the credential
    /// manager fails.
    pub fn get(&self, reference: &VarRef) -> Result<Value, VarsError> {
        let undefined = || VarsError::Undefined {
            reference: reference.to_string(),
        };

        let mut value = match self.local(&reference.name) {
            Some(value) => value,
            None if reference.local_only => return Err(undefined()),
            None => {
                let value = self.secrets.get(&reference.name)?.ok_or_else(undefined)?;
                self.tracker.track(&value);
                value
            }
        };

        for field in &reference.fields {
            value = match value {
                Value::Object(mut fields) => fields.remove(field),
                _ => None,
            }
            .ok_or_else(|| VarsError::MissingField {
                reference: reference.to_string(),
                field: field.clone(),
            })?;
        }
        Ok(value)
    }

    /// Resolves every reference inside `value`.
    ///
    /// A string that is exactly one reference becomes the referenced value;
    /// references embedded in longer strings are rendered as text.
    ///
    /// # Errors
    ///
    /// Fails on the first reference that cannot be resolved.
    pub fn interpolate(&self, value: &Value) -> Result<Value, VarsError> {
        Ok(match value {
            Value::String(raw) => {
                if let Some(reference) = whole_reference(raw) {
                    self.get(&reference)?
                } else {
                    Value::String(self.interpolate_str(raw)?)
                }
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.interpolate(item))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(fields) => Value::Object(self.interpolate_map(fields)?),
            other => other.clone(),
        })
    }

    /// [`interpolate`](Self::interpolate) over every value of a map
    ///
    /// # Errors
    ///
    /// Fails on the first reference that cannot be resolved.
    pub fn interpolate_map(&self, map: &Map<String, Value>) -> Result<Map<String, Value>, VarsError> {
        map.iter()
            .map(|(key, value)| Ok((key.clone(), self.interpolate(value)?)))
            .collect()
    }

    /// Renders every reference inside a string as text
    ///
    /// # Errors
    ///
    /// Fails on the first reference that cannot be resolved.
    pub fn interpolate_str(&self, raw: &str) -> Result<String, VarsError> {
        let mut rendered = String::with_capacity(raw.len());
        let mut last = 0;
        for found in REFERENCE.find_iter(raw) {
            rendered.push_str(&raw[last..found.start()]);
            let reference = VarRef::parse(strip_parens(found.as_str()));
            rendered.push_str(&render(&self.get(&reference)?));
            last = found.end();
        }
        rendered.push_str(&raw[last..]);
        Ok(rendered)
    }
}

/// Renders references bound in `vars`, leaving the rest untouched.
///
/// Used for pipeline templates, whose unresolved references are resolved
/// later by the builds that run them.
#[must_use]
pub fn interpolate_template(raw: &str, vars: &Map<String, Value>) -> String {
    REFERENCE
        .replace_all(raw, |caps: &regex::Captures<'_>| {
            let reference = VarRef::parse(&caps[1]);
            let mut value = vars.get(&reference.name);
            for field in &reference.fields {
                value = value.and_then(|v| v.get(field));
            }
            match value {
                Some(value) if !reference.local_only => render(value),
                _ => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn whole_reference(raw: &str) -> Option<VarRef> {
    let found = REFERENCE.find(raw)?;
    (found.start() == 0 && found.end() == raw.len()).then(|| VarRef::parse(strip_parens(raw)))
}

fn strip_parens(raw: &str) -> &str {
    raw.trim_start_matches("((").trim_end_matches("))")
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
