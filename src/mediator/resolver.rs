//! Dependency resolution: turns a declaration into the ordered closure of
//! everything it needs loaded before it can run.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use tracing::{debug, trace, warn};

use crate::bus::messages::{BusMessage, DeclarationRequest, DeclarationResponse, Topic};
use crate::bus::transport::{Delivery, MessageBus, MessageHandler};
use crate::core::errors::{MediatorError, Result};
use crate::model::declaration::{Declaration, DeclarationKind};
use crate::model::names::{ActionName, TypeRef};
use crate::model::registry::ActionModel;

/// Remote source of declarations the local model does not have
#[async_trait]
pub trait DeclarationFetcher: Send + Sync {
    /// `Ok(None)` means nobody knows the name; `Err` means the fetch itself failed
    async fn fetch(&self, name: &ActionName) -> Result<Option<Declaration>>;
}

/// Fetcher for mediators that never look beyond their own model
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalOnly;

#[async_trait]
impl DeclarationFetcher for LocalOnly {
    async fn fetch(&self, _name: &ActionName) -> Result<Option<Declaration>> {
        Ok(None)
    }
}

/// Fetches declarations with a `DeclarationRequest` round trip
#[derive(Clone)]
pub struct BusDeclarationFetcher {
    bus: Arc<dyn MessageBus>,
    timeout: Duration,
}

impl BusDeclarationFetcher {
    pub fn new(bus: Arc<dyn MessageBus>, timeout: Duration) -> Self {
        Self { bus, timeout }
    }
}

#[async_trait]
impl DeclarationFetcher for BusDeclarationFetcher {
    async fn fetch(&self, name: &ActionName) -> Result<Option<Declaration>> {
        debug!(name = %name, "Fetching declaration over the bus");
        let reply = self
            .bus
            .send_and_get_reply(
                BusMessage::DeclarationRequest(DeclarationRequest { name: name.clone() }),
                self.timeout,
            )
            .await;
        let reply = match reply {
            Ok(reply) => reply,
            // providers without the declaration stay silent
            Err(MediatorError::Bus { message, .. }) => {
                debug!(name = %name, reason = %message, "No peer serves declaration");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        match reply {
            BusMessage::DeclarationResponse(response) if &response.name == name => {
                Ok(response.declaration)
            }
            other => Err(MediatorError::bus(
                Topic::DeclarationResponse.as_str(),
                format!("unexpected reply {} while fetching {}", other.topic(), name),
            )),
        }
    }
}

/// Answers `DeclarationRequest`s from a local model
pub struct DeclarationProvider {
    model: Arc<dyn ActionModel>,
}

impl DeclarationProvider {
    pub fn new(model: Arc<dyn ActionModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl MessageHandler for DeclarationProvider {
    async fn handle(&self, mut delivery: Delivery) {
        let BusMessage::DeclarationRequest(request) = &delivery.message else {
            return;
        };
        let name = request.name.clone();
        let Some(replier) = delivery.take_replier() else {
            warn!(name = %name, "Declaration request sent without reply channel");
            return;
        };
        // silence lets a peer that has it answer
        let Some(declaration) = self.model.get_raw(&name) else {
            trace!(name = %name, "Declaration not held, not answering");
            return;
        };
        trace!(name = %name, "Serving declaration");
        replier.reply(BusMessage::DeclarationResponse(DeclarationResponse {
            name,
            declaration: Some((*declaration).clone()),
        }));
    }
}

/// Ordered, duplicate-free list of declarations; the target comes last
#[derive(Clone, Debug)]
pub struct DependencyClosure {
    entries: Vec<Arc<Declaration>>,
}

impl DependencyClosure {
    /// Keep the first occurrence of every name and put `target` last
    pub fn from_resolved(resolved: Vec<Arc<Declaration>>, target: Arc<Declaration>) -> Self {
        let mut seen = HashSet::new();
        seen.insert(target.name.clone());
        let mut entries: Vec<Arc<Declaration>> = resolved
            .into_iter()
            .filter(|d| seen.insert(d.name.clone()))
            .collect();
        entries.push(target);
        Self { entries }
    }

    pub fn target(&self) -> &Arc<Declaration> {
        // never empty: from_resolved always pushes the target
        &self.entries[self.entries.len() - 1]
    }

    pub fn entries(&self) -> &[Arc<Declaration>] {
        &self.entries
    }

    pub fn names(&self) -> Vec<ActionName> {
        self.entries.iter().map(|d| d.name.clone()).collect()
    }

    /// Entries that are executable
    pub fn actions(&self) -> impl Iterator<Item = &Arc<Declaration>> {
        self.entries.iter().filter(|d| d.is_action())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn graph(&self) -> DiGraph<&Declaration, ()> {
        let mut graph = DiGraph::new();
        let mut index: HashMap<&ActionName, NodeIndex> = HashMap::new();
        for decl in &self.entries {
            index.insert(&decl.name, graph.add_node(decl.as_ref()));
        }
        for decl in &self.entries {
            let Ok(required) = decl.required_types() else {
                continue;
            };
            for t in required {
                if let TypeRef::Named(dep) = t.element() {
                    if let (Some(&from), Some(&to)) = (index.get(dep), index.get(&decl.name)) {
                        graph.update_edge(from, to, ());
                    }
                }
            }
        }
        graph
    }

    /// Whether the declarations refer to each other in a loop
    pub fn has_cycle(&self) -> bool {
        is_cyclic_directed(&self.graph())
    }

    /// Render as a Graphviz graph; edges point from a dependency to its user
    pub fn to_dot(&self) -> String {
        let graph = self.graph();
        let mut dot = String::from("digraph DependencyClosure {\n");
        dot.push_str("  graph [rankdir=LR, nodesep=0.5];\n");
        dot.push_str("  node [fontname=\"Helvetica\"];\n\n");

        for idx in graph.node_indices() {
            let decl = graph[idx];
            let shape = match decl.kind {
                DeclarationKind::Type => "ellipse",
                DeclarationKind::Action => "box",
                DeclarationKind::Procedure => "component",
                DeclarationKind::Predefined => "box3d",
            };
            dot.push_str(&format!(
                "  n{} [label=\"{}\", shape={}];\n",
                idx.index(),
                decl.name,
                shape
            ));
        }
        dot.push('\n');
        for edge in graph.edge_references() {
            dot.push_str(&format!(
                "  n{} -> n{};\n",
                edge.source().index(),
                edge.target().index()
            ));
        }
        dot.push_str("}\n");
        dot
    }
}

impl IntoIterator for DependencyClosure {
    type Item = Arc<Declaration>;
    type IntoIter = std::vec::IntoIter<Arc<Declaration>>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Per-resolve scratch state
#[derive(Default)]
struct ResolveState {
    in_progress: HashSet<ActionName>,
    /// Fetched remotely; committed to the model only if the whole resolve succeeds
    fetched: Vec<Declaration>,
}

/// Recursive-descent resolver over the local model plus a remote fetcher
#[derive(Clone)]
pub struct DependencyResolver {
    model: Arc<dyn ActionModel>,
    fetcher: Arc<dyn DeclarationFetcher>,
}

impl DependencyResolver {
    pub fn new(model: Arc<dyn ActionModel>, fetcher: Arc<dyn DeclarationFetcher>) -> Self {
        Self { model, fetcher }
    }

    pub fn model(&self) -> &Arc<dyn ActionModel> {
        &self.model
    }

    /// Resolve `name` into its dependency-ordered declarations, ending with the
    /// declaration itself. Primitives and unknown optional names yield nothing.
    pub async fn resolve(&self, name: &str, must_exist: bool) -> Result<Vec<Arc<Declaration>>> {
        let type_ref = TypeRef::parse(name)?;
        self.resolve_ref(&type_ref, must_exist).await
    }

    pub async fn resolve_ref(
        &self,
        type_ref: &TypeRef,
        must_exist: bool,
    ) -> Result<Vec<Arc<Declaration>>> {
        let mut state = ResolveState::default();
        let resolved = self.descend(type_ref, must_exist, &mut state).await?;
        for decl in state.fetched {
            debug!(name = %decl.name, "Caching fetched declaration");
            self.model.add(decl);
        }
        Ok(resolved)
    }

    /// Full closure for an already-loaded declaration
    pub async fn closure(&self, decl: Arc<Declaration>) -> Result<DependencyClosure> {
        let mut state = ResolveState::default();
        state.in_progress.insert(decl.name.clone());
        let mut resolved = Vec::new();
        for required in decl.required_types()? {
            let deps = self
                .descend(&required, true, &mut state)
                .await
                .map_err(|e| e.required_by(decl.name.to_string()))?;
            resolved.extend(deps);
        }
        for fetched in state.fetched {
            self.model.add(fetched);
        }
        let closure = DependencyClosure::from_resolved(resolved, decl);
        trace!(
            target_name = %closure.target().name,
            entries = closure.len(),
            "Dependency closure resolved"
        );
        Ok(closure)
    }

    fn descend<'a>(
        &'a self,
        type_ref: &'a TypeRef,
        must_exist: bool,
        state: &'a mut ResolveState,
    ) -> BoxFuture<'a, Result<Vec<Arc<Declaration>>>> {
        async move {
            let name = match type_ref {
                TypeRef::Primitive(_) => return Ok(Vec::new()),
                TypeRef::Collection(element) => {
                    return self.descend(element, must_exist, state).await
                }
                TypeRef::Named(name) => name,
            };
            if state.in_progress.contains(name) {
                warn!(name = %name, "Dependency cycle detected, not descending again");
                return Ok(Vec::new());
            }

            let decl = match self.lookup(name, state).await? {
                Some(decl) => decl,
                None if must_exist => return Err(MediatorError::missing_dependency(name.to_string())),
                None => return Ok(Vec::new()),
            };

            // collected up front so recursion depth follows the dependency depth
            let required = decl.required_types()?;
            state.in_progress.insert(name.clone());
            let mut resolved = Vec::new();
            for dep in &required {
                let deps = self
                    .descend(dep, true, state)
                    .await
                    .map_err(|e| e.required_by(name.to_string()))?;
                resolved.extend(deps);
            }
            state.in_progress.remove(name);
            resolved.push(decl);
            Ok(resolved)
        }
        .boxed()
    }

    async fn lookup(
        &self,
        name: &ActionName,
        state: &mut ResolveState,
    ) -> Result<Option<Arc<Declaration>>> {
        if let Some(decl) = self.model.get_raw(name) {
            return Ok(Some(decl));
        }
        if let Some(decl) = state.fetched.iter().find(|d| &d.name == name) {
            return Ok(Some(Arc::new(decl.clone())));
        }
        match self.fetcher.fetch(name).await? {
            Some(decl) => {
                state.fetched.push(decl.clone());
                Ok(Some(Arc::new(decl)))
            }
            None => Ok(None),
        }
    }
}
