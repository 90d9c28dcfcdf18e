// crates/engram-server/src/authz/policy.rs
// Policy bundle for episodic memory, evaluated with the embedded rhai engine
//
// The bundle exposes three entry points with the same contract as the
// external policy engine it stands in for:
//   authz(input) -> bool           allow/deny per read/write/delete/search
//   attributes(input) -> map       plaintext policy attributes at write time
//   filter(input) -> map           server-side narrowing of a search
//
// A deployment fronting a real policy service swaps this module behind
// the same three calls.

use rhai::{AST, Dynamic, Engine, Scope};
use serde_json::Value;
use std::path::Path;

use super::Principal;
use crate::error::{EngramError, Result};

/// The built-in default bundle: `["user", <principal>]` subtrees belong
/// to their owner; admins see everything; searches outside the caller's
/// subtree are narrowed into it.
const DEFAULT_BUNDLE: &str = r#"
fn authz(input) {
    if input.principal.admin {
        return true;
    }
    let ns = input.namespace;
    ns.len() >= 2 && ns[0] == "user" && ns[1] == input.principal.user
}

fn attributes(input) {
    #{ owner: input.principal.user }
}

fn filter(input) {
    if input.principal.admin {
        return #{ namespace_prefix: input.namespace, filter: input.filter };
    }
    let ns = input.namespace;
    if ns.len() >= 2 && ns[0] == "user" && ns[1] == input.principal.user {
        return #{ namespace_prefix: ns, filter: input.filter };
    }
    #{ namespace_prefix: ["user", input.principal.user], filter: input.filter }
}
"#;

/// What the caller is doing; handed to the `authz` entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    Read,
    Write,
    Delete,
    Search,
}

impl PolicyAction {
    fn as_str(&self) -> &'static str {
        match self {
            PolicyAction::Read => "read",
            PolicyAction::Write => "write",
            PolicyAction::Delete => "delete",
            PolicyAction::Search => "search",
        }
    }
}

/// Input handed to every policy entry point.
pub struct PolicyInput<'a> {
    pub action: PolicyAction,
    pub namespace: &'a [String],
    pub key: Option<&'a str>,
    pub principal: &'a Principal,
    pub value: Option<&'a Value>,
    pub attributes: Option<&'a Value>,
    pub filter: Option<&'a Value>,
}

/// The `filter` entry point's narrowing result.
#[derive(Debug, Clone)]
pub struct PolicyFilter {
    pub namespace_prefix: Vec<String>,
    pub filter: Option<serde_json::Map<String, Value>>,
}

pub struct PolicyBundle {
    engine: Engine,
    ast: AST,
}

impl PolicyBundle {
    /// The built-in default bundle.
    pub fn default_bundle() -> Result<Self> {
        Self::from_script(DEFAULT_BUNDLE)
    }

    pub fn from_script(script: &str) -> Result<Self> {
        let mut engine = Engine::new();
        // Policies are pure decision functions; cap runaway scripts.
        engine.set_max_operations(100_000);
        let ast = engine
            .compile(script)
            .map_err(|e| EngramError::Policy(format!("policy bundle failed to compile: {e}")))?;
        Ok(Self { engine, ast })
    }

    /// Load a custom bundle from disk, or the default when unconfigured.
    pub fn load(script_path: Option<&Path>) -> Result<Self> {
        match script_path {
            Some(path) => {
                let script = std::fs::read_to_string(path).map_err(|e| {
                    EngramError::Config(format!("cannot read policy script {path:?}: {e}"))
                })?;
                tracing::info!(path = %path.display(), "loaded custom policy bundle");
                Self::from_script(&script)
            }
            None => Self::default_bundle(),
        }
    }

    fn input_to_dynamic(&self, input: &PolicyInput) -> Result<Dynamic> {
        let as_json = serde_json::json!({
            "action": input.action.as_str(),
            "namespace": input.namespace,
            "key": input.key,
            "principal": {
                "user": input.principal.user_id,
                "client": input.principal.client_id,
                "admin": input.principal.admin,
            },
            "value": input.value,
            "attributes": input.attributes,
            "filter": input.filter,
        });
        rhai::serde::to_dynamic(&as_json)
            .map_err(|e| EngramError::Policy(format!("policy input conversion: {e}")))
    }

    fn call(&self, name: &str, input: &PolicyInput) -> Result<Dynamic> {
        let arg = self.input_to_dynamic(input)?;
        let mut scope = Scope::new();
        self.engine
            .call_fn::<Dynamic>(&mut scope, &self.ast, name, (arg,))
            .map_err(|e| EngramError::Policy(format!("policy {name} evaluation: {e}")))
    }

    /// Allow or deny the operation. Deny is Forbidden at the surface.
    pub fn authorize(&self, input: &PolicyInput) -> Result<()> {
        let verdict = self.call("authz", input)?;
        let allowed = verdict.as_bool().map_err(|actual| {
            EngramError::Policy(format!("authz policy returned {actual}, expected bool"))
        })?;
        if allowed {
            Ok(())
        } else {
            Err(EngramError::Forbidden(format!(
                "policy denies {} on namespace {:?}",
                input.action.as_str(),
                input.namespace
            )))
        }
    }

    /// Extract plaintext policy attributes at write time.
    pub fn attributes(&self, input: &PolicyInput) -> Result<Option<serde_json::Map<String, Value>>> {
        let result = self.call("attributes", input)?;
        if result.is_unit() {
            return Ok(None);
        }
        let value: Value = rhai::serde::from_dynamic(&result)
            .map_err(|e| EngramError::Policy(format!("attributes policy output: {e}")))?;
        match value {
            Value::Null => Ok(None),
            Value::Object(map) => Ok(Some(map)),
            other => Err(EngramError::Policy(format!(
                "attributes policy returned {other}, expected object"
            ))),
        }
    }

    /// Narrow a search's namespace prefix and attribute filter.
    pub fn filter(&self, input: &PolicyInput) -> Result<PolicyFilter> {
        let result = self.call("filter", input)?;
        let value: Value = rhai::serde::from_dynamic(&result)
            .map_err(|e| EngramError::Policy(format!("filter policy output: {e}")))?;
        let object = value.as_object().ok_or_else(|| {
            EngramError::Policy("filter policy must return an object".to_string())
        })?;

        let namespace_prefix = object
            .get("namespace_prefix")
            .and_then(Value::as_array)
            .map(|segments| {
                segments
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_else(|| input.namespace.to_vec());

        let filter = match object.get("filter") {
            Some(Value::Object(map)) => Some(map.clone()),
            _ => None,
        };

        Ok(PolicyFilter { namespace_prefix, filter })
    }
}
