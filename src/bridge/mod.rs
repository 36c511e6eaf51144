//! The host-facing call surface.
//!
//! A host names a method and passes its arguments as one JSON object. The
//! method is looked up in an explicit [`MethodRegistry`], the arguments are
//! deserialized into the method's typed argument record and the outcome comes
//! back as a [`ResultEnvelope`]: `{"ok": ...}` or `{"err": {"message": ...}}`.
//! Nothing unwinds past [`call`].

pub mod c_api;

use std::panic::{self, AssertUnwindSafe};
use std::sync::LazyLock;

use ahash::AHashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{CallConfig, ReportConfig};
use crate::decompress::default_backend;
use crate::error::{CountError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Exactly one of a payload or an error message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultEnvelope<T> {
    Ok(T),
    Err(ErrorPayload),
}

impl<T> ResultEnvelope<T> {
    pub fn err(message: impl Into<String>) -> Self {
        ResultEnvelope::Err(ErrorPayload {
            message: message.into(),
        })
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ResultEnvelope::Ok(_))
    }
}

impl<T> From<Result<T>> for ResultEnvelope<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => ResultEnvelope::Ok(value),
            Err(e) => ResultEnvelope::err(e.to_string()),
        }
    }
}

impl<T: Serialize> ResultEnvelope<T> {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            serde_json::json!({ "err": { "message": format!("cannot serialize result: {e}") } })
                .to_string()
        })
    }
}

type Handler = Box<dyn Fn(&str) -> Result<Value> + Send + Sync>;

/// Method name → handler. Immutable once built.
pub struct MethodRegistry {
    methods: AHashMap<&'static str, Handler>,
}

#[derive(Default)]
pub struct MethodRegistryBuilder {
    methods: AHashMap<&'static str, Handler>,
}

impl MethodRegistryBuilder {
    /// Registers `handler` under `name`. Its argument record is deserialized
    /// from the call's JSON and its result serialized back.
    pub fn register<A, R>(mut self, name: &'static str, handler: fn(&A) -> Result<R>) -> Result<Self>
    where
        A: DeserializeOwned + 'static,
        R: Serialize + 'static,
    {
        if name.is_empty() {
            return Err(CountError::InternalFault("method name is empty".to_string()));
        }
        if self.methods.contains_key(name) {
            return Err(CountError::InternalFault(format!(
                "method '{name}' registered twice"
            )));
        }
        let wrapped = move |args: &str| -> Result<Value> {
            let args: A = serde_json::from_str(args)
                .map_err(|e| CountError::config(format!("bad arguments for '{name}': {e}")))?;
            let out = handler(&args)?;
            serde_json::to_value(out)
                .map_err(|e| CountError::InternalFault(format!("cannot serialize '{name}' result: {e}")))
        };
        self.methods.insert(name, Box::new(wrapped));
        Ok(self)
    }

    pub fn build(self) -> MethodRegistry {
        MethodRegistry {
            methods: self.methods,
        }
    }
}

impl MethodRegistry {
    pub fn builder() -> MethodRegistryBuilder {
        MethodRegistryBuilder::default()
    }

    pub fn dispatch(&self, method: &str, args_json: &str) -> Result<Value> {
        let Some(handler) = self.methods.get(method) else {
            return Err(CountError::config(format!(
                "unknown method '{method}' (known: {})",
                self.names().join(", ")
            )));
        };
        let args = if args_json.trim().is_empty() { "{}" } else { args_json };
        handler(args)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.methods.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NoArgs {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub name: String,
    pub version: String,
    pub backend: String,
}

fn count_taxa(cfg: &CallConfig) -> Result<crate::types::CountReport> {
    crate::count_taxa(cfg)
}

fn index_report(cfg: &ReportConfig) -> Result<crate::types::IndexSummary> {
    crate::index_reports(cfg)
}

fn version(_: &NoArgs) -> Result<VersionInfo> {
    Ok(VersionInfo {
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        backend: default_backend().name().to_string(),
    })
}

fn build_registry() -> Result<MethodRegistry> {
    Ok(MethodRegistry::builder()
        .register("count_taxa", count_taxa)?
        .register("index_report", index_report)?
        .register("version", version)?
        .build())
}

static REGISTRY: LazyLock<std::result::Result<MethodRegistry, String>> =
    LazyLock::new(|| build_registry().map_err(|e| e.to_string()));

/// The process-wide registry, built on first use.
pub fn registry() -> Result<&'static MethodRegistry> {
    REGISTRY
        .as_ref()
        .map_err(|msg| CountError::InternalFault(msg.clone()))
}

/// Runs `method` with JSON arguments. Every failure, panics included, comes
/// back as an `err` envelope.
pub fn call(method: &str, args_json: &str) -> ResultEnvelope<Value> {
    guarded(method, || registry()?.dispatch(method, args_json))
}

fn guarded<F>(method: &str, f: F) -> ResultEnvelope<Value>
where
    F: FnOnce() -> Result<Value>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => {
            if let Err(e) = &result {
                log::debug!("{method} failed: {e}");
            }
            result.into()
        }
        Err(payload) => ResultEnvelope::err(CountError::from_panic(method, payload).to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_json_shapes() {
        let ok: ResultEnvelope<u32> = ResultEnvelope::Ok(3);
        assert_eq!(ok.to_json(), r#"{"ok":3}"#);
        let err: ResultEnvelope<u32> = ResultEnvelope::err("boom");
        assert_eq!(err.to_json(), r#"{"err":{"message":"boom"}}"#);
        assert!(!err.is_ok());
    }

    #[test]
    fn test_unknown_method() {
        let out = call("no_such_method", "{}");
        match out {
            ResultEnvelope::Err(e) => {
                assert!(e.message.contains("unknown method 'no_such_method'"));
                assert!(e.message.contains("count_taxa"));
            }
            ResultEnvelope::Ok(v) => panic!("unexpected ok {v}"),
        }
    }

    #[test]
    fn test_bad_arguments_are_config_errors() {
        let out = call("count_taxa", "{not json");
        let ResultEnvelope::Err(e) = out else {
            panic!("expected err");
        };
        assert!(e.message.starts_with("invalid configuration"));

        let out = call("count_taxa", r#"{"input_paths":["a"],"report_paths":["b"],"barcode_patterns":[]}"#);
        let ResultEnvelope::Err(e) = out else {
            panic!("expected err");
        };
        assert!(e.message.contains("barcode pattern set is empty"));
    }

    #[test]
    fn test_version_with_empty_args() {
        let ResultEnvelope::Ok(v) = call("version", "") else {
            panic!("expected ok");
        };
        assert_eq!(v["name"], env!("CARGO_PKG_NAME"));
        assert!(v["backend"].is_string());
        assert!(!call("version", r#"{"x":1}"#).is_ok());
    }

    #[test]
    fn test_registration_rejects_duplicates_and_empty_names() {
        let dup = MethodRegistry::builder()
            .register("version", version)
            .and_then(|b| b.register("version", version));
        assert!(dup.is_err());
        assert!(MethodRegistry::builder().register("", version).is_err());
        let names = build_registry().unwrap().names();
        assert_eq!(names, vec!["count_taxa", "index_report", "version"]);
    }

    #[test]
    fn test_panicking_handler_becomes_err() {
        fn explode(_: &NoArgs) -> Result<u32> {
            panic!("handler exploded")
        }
        let reg = MethodRegistry::builder().register("explode", explode).unwrap().build();
        let ResultEnvelope::Err(e) = guarded("explode", || reg.dispatch("explode", "{}")) else {
            panic!("expected err");
        };
        assert!(e.message.contains("handler exploded"));
    }
}
