//! The model description tree: a recursive shape+dtype schema of a model's
//! weights, independent of any concrete storage. The loader allocates weights
//! from a flattened description; the quantizer rewrites leaf dtypes before
//! allocation happens.

use std::collections::BTreeMap;

use crate::loader::LoadError;

/// A leaf of the description tree: the shape and element type of one weight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDescLeaf {
    /// The dimensions of the weight, fastest-varying first. At most 2.
    pub dims: Vec<usize>,
    /// The element type the weight will be stored as in memory.
    pub dtype: ggml::Type,
}

impl ModelDescLeaf {
    /// The number of logical elements the leaf describes.
    pub fn nelements(&self) -> usize {
        self.dims.iter().product()
    }
}

/// A node of the description tree: either a leaf or an ordered set of named
/// children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelDescNode {
    /// A weight.
    Leaf(ModelDescLeaf),
    /// A named subtree. `BTreeMap` keeps flattening deterministic.
    Node(BTreeMap<String, ModelDescNode>),
}

impl ModelDescNode {
    /// Creates a leaf node.
    pub fn leaf(dims: &[usize], dtype: ggml::Type) -> Self {
        ModelDescNode::Leaf(ModelDescLeaf {
            dims: dims.to_vec(),
            dtype,
        })
    }

    /// Creates an inner node from `(name, child)` pairs.
    pub fn node(children: impl IntoIterator<Item = (String, ModelDescNode)>) -> Self {
        ModelDescNode::Node(children.into_iter().collect())
    }

    /// Flattens the tree into a `path -> leaf` mapping, joining names with
    /// `/`.
    pub fn flatten(&self) -> BTreeMap<String, ModelDescLeaf> {
        let mut out = BTreeMap::new();
        self.flatten_into("", &mut out);
        out
    }

    fn flatten_into(&self, prefix: &str, out: &mut BTreeMap<String, ModelDescLeaf>) {
        match self {
            ModelDescNode::Leaf(leaf) => {
                out.insert(prefix.to_owned(), leaf.clone());
            }
            ModelDescNode::Node(children) => {
                for (name, child) in children {
                    let path = if prefix.is_empty() {
                        name.clone()
                    } else {
                        format!("{prefix}/{name}")
                    };
                    child.flatten_into(&path, out);
                }
            }
        }
    }

    /// Rebuilds the tree by applying `f` to every leaf. Inner structure is
    /// preserved.
    pub fn map(&self, f: &impl Fn(&str, &ModelDescLeaf) -> ModelDescLeaf) -> ModelDescNode {
        self.map_at("", f)
    }

    fn map_at(&self, prefix: &str, f: &impl Fn(&str, &ModelDescLeaf) -> ModelDescLeaf) -> ModelDescNode {
        match self {
            ModelDescNode::Leaf(leaf) => ModelDescNode::Leaf(f(prefix, leaf)),
            ModelDescNode::Node(children) => ModelDescNode::Node(
                children
                    .iter()
                    .map(|(name, child)| {
                        let path = if prefix.is_empty() {
                            name.clone()
                        } else {
                            format!("{prefix}/{name}")
                        };
                        (name.clone(), child.map_at(&path, f))
                    })
                    .collect(),
            ),
        }
    }
}

/// Rewrites the description so that every rank-2 leaf whose path matches any
/// of `include` and none of `exclude` is stored as `target`. This is how a
/// caller requests on-load quantization: the loader converts matching weights
/// as it streams them in.
pub fn configure_quantization(
    desc: &ModelDescNode,
    target: ggml::Type,
    include: &[&str],
    exclude: &[&str],
) -> Result<ModelDescNode, LoadError> {
    let compile = |patterns: &[&str]| -> Result<Vec<regex::Regex>, LoadError> {
        patterns
            .iter()
            .map(|p| {
                regex::Regex::new(p).map_err(|e| LoadError::InvariantBroken {
                    invariant: format!("invalid quantization selector `{p}`: {e}"),
                })
            })
            .collect()
    };
    let include = compile(include)?;
    let exclude = compile(exclude)?;

    Ok(desc.map(&|path, leaf| {
        let selected = leaf.dims.len() == 2
            && include.iter().any(|re| re.is_match(path))
            && !exclude.iter().any(|re| re.is_match(path));
        if selected {
            ModelDescLeaf {
                dims: leaf.dims.clone(),
                dtype: target,
            }
        } else {
            leaf.clone()
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> ModelDescNode {
        ModelDescNode::node([
            (
                "model".to_owned(),
                ModelDescNode::node([
                    ("wte".to_owned(), ModelDescNode::leaf(&[8, 16], ggml::Type::F16)),
                    (
                        "ln_f".to_owned(),
                        ModelDescNode::node([
                            ("g".to_owned(), ModelDescNode::leaf(&[8], ggml::Type::F32)),
                            ("b".to_owned(), ModelDescNode::leaf(&[8], ggml::Type::F32)),
                        ]),
                    ),
                ]),
            ),
        ])
    }

    #[test]
    fn flatten_joins_paths_with_slashes() {
        let flat = sample_tree().flatten();
        let paths: Vec<&str> = flat.keys().map(String::as_str).collect();
        assert_eq!(paths, vec!["model/ln_f/b", "model/ln_f/g", "model/wte"]);
        assert_eq!(flat["model/wte"].dims, vec![8, 16]);
    }

    #[test]
    fn map_identity_preserves_flatten() {
        let tree = sample_tree();
        let mapped = tree.map(&|_, leaf| leaf.clone());
        assert_eq!(tree.flatten(), mapped.flatten());
    }

    #[test]
    fn quantization_rewrites_matching_rank2_leaves() {
        let tree = sample_tree();
        let configured =
            configure_quantization(&tree, ggml::Type::Q4_0, &["model/wte"], &[]).unwrap();
        let flat = configured.flatten();
        assert_eq!(flat["model/wte"].dtype, ggml::Type::Q4_0);
        // Rank-1 leaves are never rewritten, even if a selector matches.
        let all =
            configure_quantization(&tree, ggml::Type::Q4_0, &["model/.*"], &[]).unwrap();
        assert_eq!(all.flatten()["model/ln_f/g"].dtype, ggml::Type::F32);
    }

    #[test]
    fn exclude_selectors_win() {
        let tree = sample_tree();
        let configured =
            configure_quantization(&tree, ggml::Type::Q8_0, &["model/.*"], &["model/wte"]).unwrap();
        assert_eq!(configured.flatten()["model/wte"].dtype, ggml::Type::F16);
    }
}
