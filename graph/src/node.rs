// Copyright 2018 Engine Contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt::{Debug, Display};
use std::hash::Hash;

use petgraph::stable_graph;

use crate::Graph;

// 2^32 Nodes ought to be more than enough for anyone!
pub type EntryId = stable_graph::NodeIndex<u32>;

///
/// Defines executing a cacheable/memoizable step within the given NodeContext.
///
#[async_trait::async_trait]
pub trait Node: Clone + Debug + Display + Eq + Hash + Send + Sync + 'static {
  type Context: NodeContext<Node = Self>;

  type Item: Clone + Debug + PartialEq + Send + Sync + 'static;
  type Error: NodeError;

  async fn run(self, context: Self::Context) -> Result<Self::Item, Self::Error>;

  // TODO: Use a `Display` bound instead.
  fn format(&self) -> String;

  ///
  /// True if this Node is still safe to restart in place (i.e. re-run without invalidating
  /// its dependents) after having begun to run. A Node which has caused a side effect is no
  /// longer restartable.
  ///
  fn restartable(&self) -> bool;

  ///
  /// True if the result of this Node should be cached at all.
  ///
  fn cacheable(&self) -> bool;

  ///
  /// True if the given completed `Item` for this Node should be cached, given its content.
  ///
  fn cacheable_item(&self, item: &Self::Item) -> bool;

  ///
  /// Creates an error instance that represents that a dependency graph contained a cycle along
  /// the given path.
  ///
  fn cyclic_error(path: &[&Self]) -> Self::Error;
}

pub trait NodeError: Clone + Debug + Eq + Send + Sync {
  ///
  /// Creates an instance that represents that a Node was invalidated out of the
  /// Graph (generally while running).
  ///
  fn invalidated() -> Self;

  ///
  /// Creates an instance that represents a generic failure message.
  ///
  fn generic(message: String) -> Self;
}

///
/// A Node-like type which is not itself storable in the Graph, but which can be requested in
/// terms of some underlying `Node` that is. This allows for requesting a strongly typed subset
/// of a particular `Node`'s output type: the underlying `Node` is the unit of caching/dependency
/// tracking, but callers interact with the narrower `CompoundNode::Item` type.
///
pub trait CompoundNode<N: Node>: Into<N> + Clone + Debug + Eq + Hash + Send + Sync + 'static {
  type Item: TryFrom<N::Item> + Clone + Debug + Send + Sync + 'static;
}

///
/// A trait used to visualize Nodes in either DOT/GraphViz format.
///
pub trait NodeVisualizer<N: Node> {
  ///
  /// Returns a GraphViz color scheme name for this visualizer.
  ///
  fn color_scheme(&self) -> &str;

  ///
  /// Returns a GraphViz color name/id within Self::color_scheme for the given Node/result.
  ///
  fn color(&mut self, node: &N, result: Option<Result<N::Item, N::Error>>) -> String;
}

///
/// A trait used to visualize Nodes for the purposes of CLI-output tracing.
///
pub trait NodeTracer<N: Node> {
  ///
  /// Returns true if the given Node Result represents the "bottom" of a trace.
  ///
  fn is_bottom(result: Option<Result<N::Item, N::Error>>) -> bool;

  ///
  /// Renders the given result for a trace. The trace will already be indented by `indent`, but
  /// an implementer creating a multi-line output would need to indent them as well.
  ///
  fn state_str(indent: &str, result: Option<Result<N::Item, N::Error>>) -> String;
}

///
/// A context passed between Nodes that also stores an EntryId to uniquely identify them.
///
pub trait NodeContext: Clone + Send + 'static {
  ///
  /// The type generated when this Context is cloned for another Node.
  ///
  type Node: Node;

  ///
  /// Creates a clone of this NodeContext to be used for a different Node.
  ///
  /// To clone a Context for use for the same Node, `Clone` is used directly.
  ///
  fn clone_for(&self, entry_id: EntryId) -> <Self::Node as Node>::Context;

  ///
  /// Returns a reference to the Graph for this Context.
  ///
  fn graph(&self) -> &Graph<Self::Node>;
}
