//! Capability table.
//!
//! Capabilities are registered once at startup under dotted names
//! (`tasks.running`); every dot creates or reuses a namespace. The finished
//! [`Registry`] is immutable, so lookups need no locking.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry as MapEntry;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use steward_protocol::Kwargs;

use crate::context::{Context, Identity};
use crate::error::{CapabilityResult, DispatchError, RegistryError};

/// Who may call a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Callable by clients and listed by `commands`.
    Public,
    /// Only callable from other capabilities via [`Context::invoke`].
    Private,
    /// Callable by clients but never listed.
    Invisible,
}

/// Boxed capability body.
pub type CapabilityFn = Arc<dyn Fn(Context, Call) -> BoxFuture<'static, CapabilityResult> + Send + Sync>;

/// Arguments of one invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Call {
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
}

impl Call {
    pub fn new(args: Vec<Value>, kwargs: Kwargs) -> Self {
        Self { args, kwargs }
    }

    /// A parameter passed either at position `index` or as keyword `name`.
    pub fn param<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<Option<T>, DispatchError> {
        let Some(value) = self.args.get(index).or_else(|| self.kwargs.get(name)) else {
            return Ok(None);
        };
        serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| DispatchError::invalid(format!("argument '{name}': {e}")))
    }

    /// Like [`param`](Self::param) but missing is an error.
    pub fn required<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<T, DispatchError> {
        self.param(index, name)?
            .ok_or_else(|| DispatchError::invalid(format!("missing argument '{name}'")))
    }

    /// Like [`param`](Self::param) with a fallback.
    pub fn param_or<T: DeserializeOwned>(&self, index: usize, name: &str, default: T) -> Result<T, DispatchError> {
        Ok(self.param(index, name)?.unwrap_or(default))
    }

    /// Renders the call as `cmd(a, b, key=value)`.
    pub fn signature(&self, command: &str) -> String {
        let args = self.args.iter().map(display_value);
        let kwargs = self
            .kwargs
            .iter()
            .map(|(key, value)| format!("{key}={}", display_value(value)));
        let rendered: Vec<String> = args.chain(kwargs).collect();
        format!("{command}({})", rendered.join(", "))
    }
}

pub(crate) fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A registered, callable unit.
pub struct Capability {
    name: String,
    doc: String,
    visibility: Visibility,
    handler: CapabilityFn,
}

impl Capability {
    /// Fully qualified dotted name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn doc(&self) -> &str {
        &self.doc
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    /// Starts the body. Nothing runs until the future is polled.
    pub fn call(&self, ctx: Context, call: Call) -> BoxFuture<'static, CapabilityResult> {
        (self.handler)(ctx, call)
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("name", &self.name)
            .field("visibility", &self.visibility)
            .finish_non_exhaustive()
    }
}

/// Decides whether a remote caller may run a resolved capability.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, capability: &Capability, identity: &Identity) -> bool;
}

impl<F> Authorizer for F
where
    F: Fn(&Capability, &Identity) -> bool + Send + Sync,
{
    fn authorize(&self, capability: &Capability, identity: &Identity) -> bool {
        self(capability, identity)
    }
}

/// Lets every caller through.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _capability: &Capability, _identity: &Identity) -> bool {
        true
    }
}

#[derive(Debug)]
enum Entry {
    Leaf(Arc<Capability>),
    Namespace(Table),
}

#[derive(Debug, Default)]
struct Table {
    entries: BTreeMap<String, Entry>,
}

impl Table {
    fn collect(&self, out: &mut Vec<Arc<Capability>>) {
        for entry in self.entries.values() {
            match entry {
                Entry::Leaf(capability) => out.push(capability.clone()),
                Entry::Namespace(table) => table.collect(out),
            }
        }
    }
}

/// Immutable capability table.
#[derive(Debug, Default)]
pub struct Registry {
    root: Table,
    len: usize,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Finds a capability regardless of visibility. Namespaces are not
    /// callable and yield `None`.
    pub fn lookup(&self, path: &str) -> Option<&Arc<Capability>> {
        let mut table = &self.root;
        let mut segments = path.split('.').peekable();
        while let Some(segment) = segments.next() {
            match table.entries.get(segment)? {
                Entry::Namespace(inner) => table = inner,
                Entry::Leaf(capability) if segments.peek().is_none() => return Some(capability),
                Entry::Leaf(_) => return None,
            }
        }
        None
    }

    /// Resolves a command sent by a client.
    ///
    /// Unknown paths and namespaces are [`NotFound`]; `Private`
    /// capabilities are [`Forbidden`].
    ///
    /// [`NotFound`]: DispatchError::NotFound
    /// [`Forbidden`]: DispatchError::Forbidden
    pub fn resolve(&self, path: &str) -> Result<Arc<Capability>, DispatchError> {
        let capability = self
            .lookup(path)
            .ok_or_else(|| DispatchError::NotFound(path.to_string()))?;
        match capability.visibility {
            Visibility::Private => Err(DispatchError::Forbidden(path.to_string())),
            Visibility::Public | Visibility::Invisible => Ok(capability.clone()),
        }
    }

    /// Public capabilities in name order.
    pub fn listing(&self) -> Vec<Arc<Capability>> {
        let mut all = Vec::with_capacity(self.len);
        self.root.collect(&mut all);
        all.retain(|capability| capability.visibility == Visibility::Public);
        all
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Collects registrations before the table is frozen.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    registry: Registry,
}

impl RegistryBuilder {
    /// Registers `f` under the dotted `name`.
    pub fn add<F, Fut>(
        &mut self,
        name: &str,
        visibility: Visibility,
        doc: &str,
        f: F,
    ) -> Result<&mut Self, RegistryError>
    where
        F: Fn(Context, Call) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CapabilityResult> + Send + 'static,
    {
        let handler: CapabilityFn =
            Arc::new(move |ctx, call| -> BoxFuture<'static, CapabilityResult> { Box::pin(f(ctx, call)) });
        self.insert(Capability {
            name: name.to_string(),
            doc: doc.trim().to_string(),
            visibility,
            handler,
        })?;
        Ok(self)
    }

    fn insert(&mut self, capability: Capability) -> Result<(), RegistryError> {
        let name = capability.name.clone();
        let segments: Vec<&str> = name.split('.').collect();
        if segments.iter().any(|segment| !valid_segment(segment)) {
            return Err(RegistryError::InvalidName(name));
        }
        let Some((leaf, parents)) = segments.split_last() else {
            return Err(RegistryError::InvalidName(name));
        };

        let mut table = &mut self.registry.root;
        let mut prefix = String::new();
        for segment in parents {
            if !prefix.is_empty() {
                prefix.push('.');
            }
            prefix.push_str(segment);
            let entry = table
                .entries
                .entry((*segment).to_string())
                .or_insert_with(|| Entry::Namespace(Table::default()));
            table = match entry {
                Entry::Namespace(inner) => inner,
                Entry::Leaf(_) => {
                    return Err(RegistryError::Conflict {
                        name,
                        prefix,
                        existing: "capability",
                    });
                }
            };
        }

        match table.entries.entry((*leaf).to_string()) {
            MapEntry::Occupied(occupied) => match occupied.get() {
                Entry::Leaf(_) => Err(RegistryError::Duplicate(name)),
                Entry::Namespace(_) => Err(RegistryError::Conflict {
                    prefix: name.clone(),
                    name,
                    existing: "namespace",
                }),
            },
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry::Leaf(Arc::new(capability)));
                self.registry.len += 1;
                Ok(())
            }
        }
    }

    pub fn build(self) -> Registry {
        self.registry
    }
}

fn valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn noop(_ctx: Context, _call: Call) -> CapabilityResult {
        Ok(Value::Null)
    }

    fn sample() -> Registry {
        let mut builder = Registry::builder();
        builder
            .add("ping", Visibility::Public, "Reply with pong", noop)
            .unwrap()
            .add("deploy.start", Visibility::Public, "", noop)
            .unwrap()
            .add("deploy.secret", Visibility::Private, "", noop)
            .unwrap()
            .add("deploy.debug", Visibility::Invisible, "", noop)
            .unwrap();
        builder.build()
    }

    #[test]
    fn resolves_dotted_paths() {
        let registry = sample();
        assert_eq!(registry.len(), 4);
        assert_eq!(registry.resolve("ping").unwrap().name(), "ping");
        assert_eq!(registry.resolve("deploy.start").unwrap().name(), "deploy.start");
        assert_eq!(registry.resolve("ping").unwrap().doc(), "Reply with pong");
    }

    #[test]
    fn unresolvable_paths_are_not_found() {
        let registry = sample();
        for path in ["", "nope", "deploy", "deploy.", "deploy.start.more", "ping.x", ".ping"] {
            assert!(
                matches!(registry.resolve(path), Err(DispatchError::NotFound(_))),
                "{path:?} should not resolve"
            );
        }
    }

    #[test]
    fn private_is_forbidden_remotely_but_found_locally() {
        let registry = sample();
        assert!(matches!(
            registry.resolve("deploy.secret"),
            Err(DispatchError::Forbidden(_))
        ));
        assert!(registry.lookup("deploy.secret").is_some());
    }

    #[test]
    fn listing_shows_only_public() {
        let registry = sample();
        let names: Vec<_> = registry
            .listing()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        assert_eq!(names, vec!["deploy.start", "ping"]);
        assert!(registry.resolve("deploy.debug").is_ok());
    }

    #[test]
    fn duplicates_and_conflicts_are_rejected() {
        let mut builder = Registry::builder();
        builder.add("a.b", Visibility::Public, "", noop).unwrap();

        assert_eq!(
            builder.add("a.b", Visibility::Public, "", noop).unwrap_err(),
            RegistryError::Duplicate("a.b".into())
        );
        assert!(matches!(
            builder.add("a", Visibility::Public, "", noop),
            Err(RegistryError::Conflict { existing: "namespace", .. })
        ));
        assert!(matches!(
            builder.add("a.b.c", Visibility::Public, "", noop),
            Err(RegistryError::Conflict { existing: "capability", .. })
        ));
        assert!(matches!(
            builder.add("bad..name", Visibility::Public, "", noop),
            Err(RegistryError::InvalidName(_))
        ));
        assert!(matches!(
            builder.add("sp ace", Visibility::Public, "", noop),
            Err(RegistryError::InvalidName(_))
        ));
    }

    #[test]
    fn call_parameters() {
        let call = Call::new(
            vec![json!("web"), json!(3)],
            Kwargs::from_iter([("force".to_string(), json!(true))]),
        );
        assert_eq!(call.required::<String>(0, "host").unwrap(), "web");
        assert_eq!(call.param::<u32>(1, "count").unwrap(), Some(3));
        assert_eq!(call.param::<bool>(2, "force").unwrap(), Some(true));
        assert_eq!(call.param_or(5, "retries", 2_u32).unwrap(), 2);
        assert!(matches!(
            call.required::<String>(9, "missing"),
            Err(DispatchError::InvalidArguments(_))
        ));
        assert!(matches!(
            call.param::<u32>(0, "host"),
            Err(DispatchError::InvalidArguments(_))
        ));
    }

    #[test]
    fn call_signature() {
        let call = Call::new(
            vec![json!("web"), json!(3)],
            Kwargs::from_iter([("force".to_string(), json!(true))]),
        );
        assert_eq!(call.signature("deploy"), "deploy(web, 3, force=true)");
        assert_eq!(Call::default().signature("ping"), "ping()");
    }
}
