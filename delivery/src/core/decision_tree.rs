//! Decision trees that map a push to at most one value.
//!
//! ```text
//! given([is_maven(), to_default_branch()])
//!     .it_means("maven service")
//!     .then(vec![
//!         given([has_file("manifest.yml")]).it_means("cloud").set(cloud_goals),
//!         set("local", local_goals),
//!     ])
//! ```
//!
//! Resolution is first match wins. Guards are evaluated in order and the
//! first false guard ends evaluation of the node. Children are tried in the
//! order they were given and the first one to produce a value decides the
//! result. Nothing ranks mappings other than that order: put the most
//! specific rule first.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::core::goal::Goals;
use crate::core::push::PushInvocation;
use crate::core::push_test::{PushTestRef, all_satisfied};

/// Computes a value for a push, or `None` when it does not apply.
#[async_trait]
pub trait PushMapping<V>: Send + Sync {
    fn name(&self) -> &str;

    async fn value_for_push(&self, push: &PushInvocation) -> Result<Option<V>>;
}

pub type PushMappingRef<V> = Arc<dyn PushMapping<V>>;

/// Ordered alternatives; the first mapping that yields a value wins.
pub struct PushRules<V> {
    name: String,
    choices: Vec<PushMappingRef<V>>,
}

impl<V> PushRules<V> {
    pub fn new(name: impl Into<String>, choices: Vec<PushMappingRef<V>>) -> Self {
        Self {
            name: name.into(),
            choices,
        }
    }

    /// Append a mapping. It is consulted after every mapping added before it.
    pub fn add(&mut self, mapping: PushMappingRef<V>) -> &mut Self {
        self.choices.push(mapping);
        self
    }

    pub fn len(&self) -> usize {
        self.choices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.choices.is_empty()
    }
}

#[async_trait]
impl<V: Send + Sync + 'static> PushMapping<V> for PushRules<V> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn value_for_push(&self, push: &PushInvocation) -> Result<Option<V>> {
        for choice in &self.choices {
            if let Some(value) = choice.value_for_push(push).await? {
                debug!(rules = %self.name, matched = choice.name(), "push mapping matched");
                return Ok(Some(value));
            }
        }
        Ok(None)
    }
}

/// Start a tree node guarded by `tests`, all of which must pass.
pub fn given<V>(tests: impl IntoIterator<Item = PushTestRef>) -> TreeContext<V> {
    TreeContext {
        tests: tests.into_iter().collect(),
        _value: std::marker::PhantomData,
    }
}

/// Goal-set rule: `when_push_satisfies(tests).it_means(..).set_goals(goals)`.
pub fn when_push_satisfies(tests: impl IntoIterator<Item = PushTestRef>) -> TreeContext<Goals> {
    given(tests)
}

/// Unconditional leaf that always resolves to `value`.
pub fn set<V>(name: impl Into<String>, value: V) -> PushMappingRef<V>
where
    V: Clone + Send + Sync + 'static,
{
    Arc::new(Leaf {
        name: name.into(),
        guard: None,
        value,
    })
}

pub struct TreeContext<V> {
    tests: Vec<PushTestRef>,
    _value: std::marker::PhantomData<fn() -> V>,
}

impl<V> TreeContext<V> {
    pub fn it_means(self, name: impl Into<String>) -> GivenTree<V> {
        GivenTree {
            guard: all_satisfied(self.tests),
            name: name.into(),
            _value: std::marker::PhantomData,
        }
    }
}

pub struct GivenTree<V> {
    guard: PushTestRef,
    name: String,
    _value: std::marker::PhantomData<fn() -> V>,
}

impl<V> GivenTree<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Resolve to `value` when the guards pass.
    pub fn set(self, value: V) -> PushMappingRef<V> {
        Arc::new(Leaf {
            name: self.name,
            guard: Some(self.guard),
            value,
        })
    }

    /// Enter a subtree. Children are evaluated only when the guards pass.
    pub fn then(self, mappings: Vec<PushMappingRef<V>>) -> PushMappingRef<V> {
        Arc::new(Branch {
            rules: PushRules::new(self.name.clone(), mappings),
            name: self.name,
            guard: self.guard,
        })
    }
}

impl GivenTree<Goals> {
    pub fn set_goals(self, goals: Goals) -> PushMappingRef<Goals> {
        self.set(goals)
    }
}

struct Leaf<V> {
    name: String,
    guard: Option<PushTestRef>,
    value: V,
}

#[async_trait]
impl<V> PushMapping<V> for Leaf<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn value_for_push(&self, push: &PushInvocation) -> Result<Option<V>> {
        if let Some(guard) = &self.guard
            && !guard.test(push).await?
        {
            debug!(node = %self.name, guard = guard.name(), "guard rejected push");
            return Ok(None);
        }
        Ok(Some(self.value.clone()))
    }
}

struct Branch<V> {
    name: String,
    guard: PushTestRef,
    rules: PushRules<V>,
}

#[async_trait]
impl<V: Send + Sync + 'static> PushMapping<V> for Branch<V> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn value_for_push(&self, push: &PushInvocation) -> Result<Option<V>> {
        if !self.guard.test(push).await? {
            debug!(node = %self.name, guard = self.guard.name(), "guard rejected push");
            return Ok(None);
        }
        self.rules.value_for_push(push).await
    }
}
