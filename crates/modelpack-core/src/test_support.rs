//! Tiny deterministic checkpoints for tests.
//!
//! Shared by the unit tests and the integration tests (which include this
//! file by path), so it only depends on external crates.

#![allow(dead_code)]

use std::path::Path;

use safetensors::tensor::TensorView;
use safetensors::Dtype;
use serde_json::{json, Value};

pub const VOCAB: [&str; 16] = [
    "[PAD]", "[UNK]", "[CLS]", "[SEP]", "sample", "text", "hello", "world", "great", "terrible",
    "movie", "the", "a", "is", "was", "not",
];
pub const HIDDEN: usize = 8;
pub const HEADS: usize = 2;
pub const INTERMEDIATE: usize = 16;
pub const MAX_POSITIONS: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixtureFamily {
    Bert,
    Roberta,
    DistilBert,
}

impl FixtureFamily {
    pub fn model_type(&self) -> &'static str {
        match self {
            FixtureFamily::Bert => "bert",
            FixtureFamily::Roberta => "roberta",
            FixtureFamily::DistilBert => "distilbert",
        }
    }

    /// `config.json` contents. `num_labels` adds an `id2label` table.
    pub fn config_json(&self, num_labels: Option<usize>) -> Value {
        self.config_json_with_positions(num_labels, MAX_POSITIONS)
    }

    pub fn config_json_with_positions(&self, num_labels: Option<usize>, positions: usize) -> Value {
        let mut config = match self {
            FixtureFamily::DistilBert => json!({
                "model_type": "distilbert",
                "vocab_size": VOCAB.len(),
                "dim": HIDDEN,
                "n_layers": 1,
                "n_heads": HEADS,
                "hidden_dim": INTERMEDIATE,
                "activation": "gelu",
                "max_position_embeddings": positions,
                "pad_token_id": 0
            }),
            FixtureFamily::Bert | FixtureFamily::Roberta => json!({
                "model_type": self.model_type(),
                "vocab_size": VOCAB.len(),
                "hidden_size": HIDDEN,
                "num_hidden_layers": 1,
                "num_attention_heads": HEADS,
                "intermediate_size": INTERMEDIATE,
                "hidden_act": "gelu",
                "max_position_embeddings": positions,
                "type_vocab_size": if *self == FixtureFamily::Roberta { 1 } else { 2 },
                "layer_norm_eps": 1e-12,
                "pad_token_id": if *self == FixtureFamily::Roberta { 1 } else { 0 }
            }),
        };
        if let Some(n) = num_labels {
            let labels: serde_json::Map<String, Value> = (0..n)
                .map(|i| (i.to_string(), Value::String(format!("LABEL_{i}"))))
                .collect();
            config["id2label"] = Value::Object(labels);
        }
        config
    }

    fn weight_shapes(&self, num_labels: Option<usize>, positions: usize) -> Vec<(String, Vec<usize>)> {
        let h = HIDDEN;
        let mut shapes: Vec<(String, Vec<usize>)> = Vec::new();
        let mut add = |name: String, shape: Vec<usize>| shapes.push((name, shape));
        // Task checkpoints nest the encoder under the family name.
        let prefix = if num_labels.is_some() {
            format!("{}.", self.model_type())
        } else {
            String::new()
        };

        add(format!("{prefix}embeddings.word_embeddings.weight"), vec![VOCAB.len(), h]);
        add(format!("{prefix}embeddings.position_embeddings.weight"), vec![positions, h]);
        add(format!("{prefix}embeddings.LayerNorm.weight"), vec![h]);
        add(format!("{prefix}embeddings.LayerNorm.bias"), vec![h]);

        let linear = |add: &mut dyn FnMut(String, Vec<usize>), name: String, out: usize, inp: usize| {
            add(format!("{name}.weight"), vec![out, inp]);
            add(format!("{name}.bias"), vec![out]);
        };
        let norm = |add: &mut dyn FnMut(String, Vec<usize>), name: String| {
            add(format!("{name}.weight"), vec![h]);
            add(format!("{name}.bias"), vec![h]);
        };

        match self {
            FixtureFamily::DistilBert => {
                let base = format!("{prefix}transformer.layer.0");
                for proj in ["q_lin", "k_lin", "v_lin", "out_lin"] {
                    linear(&mut add, format!("{base}.attention.{proj}"), h, h);
                }
                norm(&mut add, format!("{base}.sa_layer_norm"));
                linear(&mut add, format!("{base}.ffn.lin1"), INTERMEDIATE, h);
                linear(&mut add, format!("{base}.ffn.lin2"), h, INTERMEDIATE);
                norm(&mut add, format!("{base}.output_layer_norm"));
                if let Some(n) = num_labels {
                    linear(&mut add, "pre_classifier".to_string(), h, h);
                    linear(&mut add, "classifier".to_string(), n, h);
                }
            }
            FixtureFamily::Bert | FixtureFamily::Roberta => {
                let types = if *self == FixtureFamily::Roberta { 1 } else { 2 };
                add(format!("{prefix}embeddings.token_type_embeddings.weight"), vec![types, h]);
                let base = format!("{prefix}encoder.layer.0");
                for proj in ["query", "key", "value"] {
                    linear(&mut add, format!("{base}.attention.self.{proj}"), h, h);
                }
                linear(&mut add, format!("{base}.attention.output.dense"), h, h);
                norm(&mut add, format!("{base}.attention.output.LayerNorm"));
                linear(&mut add, format!("{base}.intermediate.dense"), INTERMEDIATE, h);
                linear(&mut add, format!("{base}.output.dense"), h, INTERMEDIATE);
                norm(&mut add, format!("{base}.output.LayerNorm"));

                let with_pooler = *self == FixtureFamily::Bert || num_labels.is_none();
                if with_pooler {
                    linear(&mut add, format!("{prefix}pooler.dense"), h, h);
                }
                if let Some(n) = num_labels {
                    if *self == FixtureFamily::Roberta {
                        linear(&mut add, "classifier.dense".to_string(), h, h);
                        linear(&mut add, "classifier.out_proj".to_string(), n, h);
                    } else {
                        linear(&mut add, "classifier".to_string(), n, h);
                    }
                }
            }
        }
        shapes
    }

    /// Serialized `model.safetensors`.
    pub fn safetensors_bytes(&self, num_labels: Option<usize>) -> Vec<u8> {
        self.safetensors_bytes_with_positions(num_labels, MAX_POSITIONS)
    }

    fn safetensors_bytes_with_positions(&self, num_labels: Option<usize>, positions: usize) -> Vec<u8> {
        let buffers: Vec<(String, Vec<usize>, Vec<u8>)> = self
            .weight_shapes(num_labels, positions)
            .into_iter()
            .map(|(name, shape)| {
                let numel: usize = shape.iter().product();
                let values = fixture_values(&name, numel);
                let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
                (name, shape, bytes)
            })
            .collect();
        let views: Vec<(String, TensorView<'_>)> = buffers
            .iter()
            .map(|(name, shape, bytes)| {
                (
                    name.clone(),
                    TensorView::new(Dtype::F32, shape.clone(), bytes).unwrap(),
                )
            })
            .collect();
        safetensors::serialize(views, &None).unwrap()
    }

    /// Write `config.json`, `tokenizer.json` and `model.safetensors` into `dir`.
    pub fn write_checkpoint(&self, dir: &Path, num_labels: Option<usize>) {
        self.write_checkpoint_with_positions(dir, num_labels, MAX_POSITIONS);
    }

    /// Like [`write_checkpoint`](Self::write_checkpoint) with a custom position table size.
    pub fn write_checkpoint_with_positions(&self, dir: &Path, num_labels: Option<usize>, positions: usize) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(
            dir.join("config.json"),
            serde_json::to_vec_pretty(&self.config_json_with_positions(num_labels, positions)).unwrap(),
        )
        .unwrap();
        std::fs::write(dir.join("tokenizer.json"), tokenizer_json()).unwrap();
        std::fs::write(
            dir.join("model.safetensors"),
            self.safetensors_bytes_with_positions(num_labels, positions),
        )
        .unwrap();
    }
}

/// Deterministic pseudo-random weights. Norm scales sit around 1.
fn fixture_values(name: &str, numel: usize) -> Vec<f32> {
    let mut state: u64 = name
        .bytes()
        .fold(0x9E37_79B9_7F4A_7C15, |acc, b| (acc ^ u64::from(b)).wrapping_mul(0x100_0000_01B3));
    let is_norm_scale = name.ends_with("LayerNorm.weight") || name.ends_with("layer_norm.weight");
    (0..numel)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let unit = (state >> 40) as f32 / (1u64 << 24) as f32 - 0.5;
            if is_norm_scale {
                1.0 + unit * 0.1
            } else {
                unit * 0.4
            }
        })
        .collect()
}

/// WordLevel tokenizer over [`VOCAB`] with BERT-style special tokens.
pub fn tokenizer_json() -> String {
    let vocab: serde_json::Map<String, Value> = VOCAB
        .iter()
        .enumerate()
        .map(|(i, token)| (token.to_string(), json!(i)))
        .collect();
    json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": {"type": "Lowercase"},
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": {"type": "BertProcessing", "sep": ["[SEP]", 3], "cls": ["[CLS]", 2]},
        "decoder": null,
        "model": {"type": "WordLevel", "vocab": vocab, "unk_token": "[UNK]"}
    })
    .to_string()
}

/// The same tokenizer with its own fixed padding and truncation to `length`,
/// as many hub checkpoints ship it.
pub fn tokenizer_json_with_limits(length: usize) -> String {
    let mut tokenizer: Value = serde_json::from_str(&tokenizer_json()).unwrap();
    tokenizer["padding"] = json!({
        "strategy": {"Fixed": length},
        "direction": "Right",
        "pad_to_multiple_of": null,
        "pad_id": 0,
        "pad_type_id": 0,
        "pad_token": "[PAD]"
    });
    tokenizer["truncation"] = json!({
        "direction": "Right",
        "max_length": length,
        "strategy": "LongestFirst",
        "stride": 0
    });
    tokenizer.to_string()
}

/// `vocab.txt` for WordPiece-only checkpoints.
pub fn vocab_txt() -> String {
    VOCAB.iter().map(|token| format!("{token}\n")).collect()
}

/// A `models.yaml` body from `(name, entry yaml)` pairs.
pub fn registry_yaml(entries: &[(&str, &str)]) -> String {
    let mut out = String::from("models:\n");
    for (name, body) in entries {
        out.push_str(&format!("  {name}:\n"));
        for line in body.lines().filter(|l| !l.trim().is_empty()) {
            out.push_str(&format!("    {}\n", line.trim()));
        }
    }
    out
}
