//! Typed tensor graph captured by tracing a model on a sample input.
//!
//! A [`FrozenGraph`] is a static dataflow graph: fixed input shapes, all
//! weights bound as named initializers, no control flow. It is produced by
//! the [`Tracer`] and consumed by the lowerer.

mod kernels;
mod ops;
mod tracer;
mod types;

use std::collections::{BTreeMap, HashSet};

use candle_core::Tensor;

use crate::error::{ConvertError, Result};

pub use kernels::{eval, int_tensor, storage_dtype};
pub use ops::{broadcast_shapes, Op, LATEST_SPEC_VERSION};
pub use tracer::Tracer;
pub use types::{format_shape, DType, TensorSpec, TensorType};

/// Index of a value inside one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub usize);

/// Where a value comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueOrigin {
    /// Declared graph input.
    Input(String),
    /// Named initializer.
    Weight(String),
    /// Output of the node at this index.
    Node(usize),
}

#[derive(Debug, Clone)]
pub struct ValueInfo {
    pub ty: TensorType,
    pub origin: ValueOrigin,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub op: Op,
    pub inputs: Vec<ValueId>,
    pub output: ValueId,
}

/// A traced graph with its weights bound.
#[derive(Debug, Clone)]
pub struct FrozenGraph {
    pub(crate) values: Vec<ValueInfo>,
    pub(crate) nodes: Vec<Node>,
    pub(crate) inputs: Vec<(String, ValueId)>,
    pub(crate) outputs: Vec<(String, ValueId)>,
    pub(crate) weights: BTreeMap<String, Tensor>,
}

impl FrozenGraph {
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn value(&self, id: ValueId) -> &ValueInfo {
        &self.values[id.0]
    }

    pub fn inputs(&self) -> &[(String, ValueId)] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[(String, ValueId)] {
        &self.outputs
    }

    pub fn weights(&self) -> &BTreeMap<String, Tensor> {
        &self.weights
    }

    pub fn output_names(&self) -> Vec<&str> {
        self.outputs.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn input_type(&self, name: &str) -> Option<&TensorType> {
        self.inputs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, id)| &self.values[id.0].ty)
    }

    pub fn output_type(&self, name: &str) -> Option<&TensorType> {
        self.outputs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, id)| &self.values[id.0].ty)
    }

    /// Drop nodes and weights that no output depends on.
    pub(crate) fn prune(&mut self) {
        let mut live: HashSet<ValueId> = self.outputs.iter().map(|(_, id)| *id).collect();
        let mut kept = Vec::with_capacity(self.nodes.len());

        for node in self.nodes.drain(..).rev() {
            if live.contains(&node.output) {
                live.extend(node.inputs.iter().copied());
                kept.push(node);
            }
        }
        kept.reverse();
        self.nodes = kept;

        let used: HashSet<&str> = self
            .values
            .iter()
            .enumerate()
            .filter(|(i, _)| live.contains(&ValueId(*i)))
            .filter_map(|(_, info)| match &info.origin {
                ValueOrigin::Weight(name) => Some(name.as_str()),
                _ => None,
            })
            .collect();
        self.weights.retain(|name, _| used.contains(name.as_str()));
    }

    /// Run the graph on concrete inputs, returning every named output.
    pub fn evaluate(&self, feeds: &BTreeMap<String, Tensor>) -> Result<BTreeMap<String, Tensor>> {
        let mut env: Vec<Option<Tensor>> = vec![None; self.values.len()];

        for (name, id) in &self.inputs {
            let tensor = feeds
                .get(name)
                .ok_or_else(|| ConvertError::runtime(format!("missing input {name}")))?;
            env[id.0] = Some(tensor.clone());
        }
        for (i, info) in self.values.iter().enumerate() {
            if let ValueOrigin::Weight(name) = &info.origin {
                env[i] = self.weights.get(name).cloned();
            }
        }

        for node in &self.nodes {
            let args = node
                .inputs
                .iter()
                .map(|id| {
                    env[id.0].as_ref().ok_or_else(|| {
                        ConvertError::runtime(format!("value {} used before definition", id.0))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            env[node.output.0] = Some(eval(&node.op, &args)?);
        }

        self.outputs
            .iter()
            .map(|(name, id)| {
                env[id.0]
                    .clone()
                    .map(|t| (name.clone(), t))
                    .ok_or_else(|| ConvertError::runtime(format!("output {name} was not computed")))
            })
            .collect()
    }
}
