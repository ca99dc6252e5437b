//! Records operations while evaluating them on a concrete sample input.

use std::collections::{BTreeMap, HashMap, HashSet};

use candle_core::{DType as CandleDType, Tensor};
use tracing::{debug, warn};

use super::kernels::{eval, int_tensor};
use super::ops::Op;
use super::types::{DType, TensorType};
use super::{FrozenGraph, Node, ValueId, ValueInfo, ValueOrigin};
use crate::error::{ConvertError, Result};

/// Builds a [`FrozenGraph`] by running a forward pass.
///
/// Every call to [`Tracer::apply`] both type-checks the operation and runs
/// it, so a traced graph is known to execute on the sample it was traced with.
pub struct Tracer {
    strict: bool,
    values: Vec<ValueInfo>,
    tensors: Vec<Tensor>,
    nodes: Vec<Node>,
    inputs: Vec<(String, ValueId)>,
    weight_ids: HashMap<String, ValueId>,
    weights: BTreeMap<String, Tensor>,
}

impl Tracer {
    /// A strict tracer asserts evaluated shapes and accepts a single graph output.
    pub fn new(strict: bool) -> Self {
        Self {
            strict,
            values: Vec::new(),
            tensors: Vec::new(),
            nodes: Vec::new(),
            inputs: Vec::new(),
            weight_ids: HashMap::new(),
            weights: BTreeMap::new(),
        }
    }

    /// Declare an int32 graph input bound to sample data.
    pub fn input(&mut self, name: &str, data: &[i32], shape: &[usize]) -> Result<ValueId> {
        if self.inputs.iter().any(|(n, _)| n == name) {
            return Err(ConvertError::tracing(format!("input {name} declared twice")));
        }
        let tensor = int_tensor(data, shape)
            .map_err(|e| ConvertError::tracing(format!("sample input {name}: {e}")))?;
        let id = self.push(
            TensorType::int(shape.to_vec()),
            ValueOrigin::Input(name.to_string()),
            tensor,
        );
        self.inputs.push((name.to_string(), id));
        Ok(id)
    }

    /// Bind a named weight. Binding the same name twice returns the same value.
    pub fn weight(&mut self, name: &str, tensor: &Tensor) -> ValueId {
        if let Some(id) = self.weight_ids.get(name) {
            return *id;
        }
        let dtype = match tensor.dtype() {
            CandleDType::I64 | CandleDType::U32 | CandleDType::U8 => DType::Int32,
            _ => DType::Float32,
        };
        let id = self.push(
            TensorType::new(dtype, tensor.dims().to_vec()),
            ValueOrigin::Weight(name.to_string()),
            tensor.clone(),
        );
        self.weight_ids.insert(name.to_string(), id);
        self.weights.insert(name.to_string(), tensor.clone());
        id
    }

    /// Record and evaluate one operation.
    pub fn apply(&mut self, op: Op, inputs: &[ValueId]) -> Result<ValueId> {
        let types: Vec<&TensorType> = inputs.iter().map(|id| &self.values[id.0].ty).collect();
        let ty = op
            .infer(&types)
            .map_err(|m| ConvertError::tracing(format!("{} rejected its inputs: {m}", op.name())))?;

        let args: Vec<&Tensor> = inputs.iter().map(|id| &self.tensors[id.0]).collect();
        let tensor = eval(&op, &args)
            .map_err(|e| ConvertError::tracing(format!("{} failed to evaluate: {e}", op.name())))?;

        if tensor.dims() != ty.shape.as_slice() {
            let message = format!(
                "{} produced shape {:?}, expected {}",
                op.name(),
                tensor.dims(),
                ty.shape_string()
            );
            if self.strict {
                return Err(ConvertError::tracing(message));
            }
            warn!("{}", message);
        }

        let output = ValueId(self.values.len());
        self.nodes.push(Node {
            op,
            inputs: inputs.to_vec(),
            output,
        });
        let node_index = self.nodes.len() - 1;
        Ok(self.push(ty, ValueOrigin::Node(node_index), tensor))
    }

    pub fn ty(&self, id: ValueId) -> &TensorType {
        &self.values[id.0].ty
    }

    /// Close the trace over the named outputs.
    pub fn finish(self, outputs: Vec<(String, ValueId)>) -> Result<FrozenGraph> {
        if outputs.is_empty() {
            return Err(ConvertError::tracing("model produced no outputs"));
        }
        let mut seen = HashSet::new();
        for (name, _) in &outputs {
            if !seen.insert(name.as_str()) {
                return Err(ConvertError::tracing(format!("duplicate output name {name}")));
            }
        }
        if self.strict && outputs.len() != 1 {
            return Err(ConvertError::tracing(format!(
                "strict tracing expects a single tensor output, got {}",
                outputs.len()
            )));
        }

        let mut graph = FrozenGraph {
            values: self.values,
            nodes: self.nodes,
            inputs: self.inputs,
            outputs,
            weights: self.weights,
        };
        let before = graph.nodes.len();
        graph.prune();
        debug!(
            "Traced {} nodes ({} pruned), {} weights",
            graph.nodes.len(),
            before - graph.nodes.len(),
            graph.weights.len()
        );
        Ok(graph)
    }

    fn push(&mut self, ty: TensorType, origin: ValueOrigin, tensor: Tensor) -> ValueId {
        let id = ValueId(self.values.len());
        self.values.push(ValueInfo { ty, origin });
        self.tensors.push(tensor);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn weight(data: &[f32], shape: &[usize]) -> Tensor {
        Tensor::from_vec(data.to_vec(), shape, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_trace_and_prune() {
        let mut tracer = Tracer::new(false);
        let ids = tracer.input("input_ids", &[1, 0], &[1, 2]).unwrap();
        let table = tracer.weight("emb", &weight(&[1.0, 2.0, 3.0, 4.0], &[2, 2]));
        let unused = tracer.weight("unused", &weight(&[0.0; 2], &[2]));
        let hidden = tracer.apply(Op::Gather, &[ids, table]).unwrap();
        let _dead = tracer.apply(Op::Tanh, &[hidden]).unwrap();
        let out = tracer.apply(Op::Relu, &[hidden]).unwrap();
        assert_eq!(tracer.ty(out), &TensorType::float([1, 2, 2]));
        let _ = unused;

        let graph = tracer.finish(vec![("out".into(), out)]).unwrap();
        assert_eq!(graph.nodes().len(), 2);
        assert!(graph.weights().contains_key("emb"));
        assert!(!graph.weights().contains_key("unused"));

        let mut feeds = BTreeMap::new();
        feeds.insert("input_ids".to_string(), int_tensor(&[0, 1], &[1, 2]).unwrap());
        let result = graph.evaluate(&feeds).unwrap();
        let values: Vec<Vec<Vec<f32>>> = result["out"].to_vec3().unwrap();
        assert_eq!(values[0], vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
    }

    #[test]
    fn test_weight_binding_is_deduplicated() {
        let mut tracer = Tracer::new(false);
        let w = weight(&[1.0, 2.0], &[2]);
        assert_eq!(tracer.weight("w", &w), tracer.weight("w", &w));
    }

    #[test]
    fn test_type_errors_are_tracing_errors() {
        let mut tracer = Tracer::new(false);
        let ids = tracer.input("input_ids", &[1, 2], &[1, 2]).unwrap();
        let err = tracer.apply(Op::Softmax, &[ids]).unwrap_err();
        assert!(matches!(err, ConvertError::Tracing { .. }));
    }

    #[test]
    fn test_output_structure_rules() {
        let mut tracer = Tracer::new(true);
        let w = tracer.weight("w", &weight(&[1.0, 2.0], &[1, 2]));
        let a = tracer.apply(Op::Tanh, &[w]).unwrap();
        let b = tracer.apply(Op::Relu, &[w]).unwrap();
        let err = tracer
            .finish(vec![("a".into(), a), ("b".into(), b)])
            .unwrap_err();
        assert!(err.to_string().contains("single tensor output"));

        let tracer = Tracer::new(false);
        assert!(tracer.finish(Vec::new()).is_err());

        let mut tracer = Tracer::new(false);
        let w = tracer.weight("w", &weight(&[1.0], &[1, 1]));
        let err = tracer
            .finish(vec![("x".into(), w), ("x".into(), w)])
            .unwrap_err();
        assert!(err.to_string().contains("duplicate output name"));
    }
}
