//! Field mapping and dependency resolution.
//!
//! Turns the declared [`FieldInfo`] sources of every node in a scope into a
//! [`DependencyInfo`]: which producers must run first, how their output
//! fields map onto the consumer's input positions, which fields are static
//! or variable-backed, and which parent-scope fields a composite must carry
//! over into its inner runs.
//!
//! Classification rules:
//!
//! - a static value never creates an edge,
//! - a variable reference never creates an edge,
//! - a same-scope reference with a direct connection is a mapped input
//!   (whole-output passthrough when both paths are empty),
//! - a same-scope reference without a direct connection is still an
//!   execution-order dependency, tracked separately,
//! - a parent-scope reference from inside a composite is rewritten to read
//!   from the inner entry node under a flattened `#`-joined key, and the
//!   composite records a carry-over so the parent value travels inward,
//! - a connection carrying no field mapping is an order-only dependency.

use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use tracing::trace;

use super::ResolverError;
use crate::schema::{FieldSource, NodeSchema, TypeInfo, VarKind, WorkflowSchema};
use crate::schema::{FieldInfo, FieldRef};
use crate::types::{FieldPath, NodeKey};
use crate::utils::json_ext::{ValueMap, get_map_value};

/// First-element extraction plan for source paths that traverse arrays
/// (`a.b[].c` positions). `positions` holds the indices of path segments
/// whose value is an array to drill into.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArrayDrill {
    pub positions: Vec<usize>,
}

/// One resolved field mapping from a producer's output onto a consumer's
/// input position.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldMapping {
    pub from_node: NodeKey,
    pub from_path: FieldPath,
    pub to_path: FieldPath,
    pub drill: Option<ArrayDrill>,
}

impl FieldMapping {
    /// Extract this mapping's value from the producer's output map.
    ///
    /// Returns `Ok(None)` when the plain source field is absent. Drill-down
    /// extraction fails fast: an empty array, a non-object element, or a
    /// missing field mid-path is an error rather than an absent value.
    pub fn extract(&self, output: &ValueMap) -> Result<Option<Value>, ResolverError> {
        if self.from_path.is_empty() {
            return Ok(Some(Value::Object(output.clone())));
        }
        match &self.drill {
            None => Ok(get_map_value(output, &self.from_path).cloned()),
            Some(drill) => self.extract_drilled(output, drill).map(Some),
        }
    }

    fn extract_drilled(&self, output: &ValueMap, drill: &ArrayDrill) -> Result<Value, ResolverError> {
        let segs = self.from_path.segments();
        let mut current = Value::Object(output.clone());
        for (i, seg) in segs.iter().enumerate() {
            let obj = current.as_object().ok_or_else(|| ResolverError::DrillNotAnObject {
                node: self.from_node.clone(),
                path: segs[..i].join("."),
            })?;
            let mut value = obj
                .get(seg)
                .cloned()
                .ok_or_else(|| ResolverError::DrillMissingField {
                    node: self.from_node.clone(),
                    path: segs[..=i].join("."),
                })?;
            if drill.positions.contains(&i) {
                let arr = value.as_array().ok_or_else(|| ResolverError::DrillNotAnArray {
                    node: self.from_node.clone(),
                    path: segs[..=i].join("."),
                })?;
                value = arr
                    .first()
                    .cloned()
                    .ok_or_else(|| ResolverError::DrillEmptyArray {
                        node: self.from_node.clone(),
                        path: segs[..=i].join("."),
                    })?;
            }
            current = value;
        }
        Ok(current)
    }
}

/// A literal input value fixed at authoring time.
#[derive(Clone, Debug, PartialEq)]
pub struct StaticValue {
    pub to_path: FieldPath,
    pub value: Value,
}

/// A variable-store-backed input field. Never a graph edge.
#[derive(Clone, Debug, PartialEq)]
pub struct VariableMapping {
    pub kind: VarKind,
    pub from_path: FieldPath,
    pub to_path: FieldPath,
}

/// Everything the engine needs to schedule one node and assemble its input.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DependencyInfo {
    /// Directly-connected producers and their field mappings.
    pub inputs: FxHashMap<NodeKey, Vec<FieldMapping>>,
    /// Directly-connected producers whose whole output becomes the input.
    pub full_inputs: FxHashSet<NodeKey>,
    /// Producers referenced without a direct connection; still ordering
    /// dependencies.
    pub indirect_inputs: FxHashMap<NodeKey, Vec<FieldMapping>>,
    /// Whole-output variant of `indirect_inputs`.
    pub full_indirect_inputs: FxHashSet<NodeKey>,
    /// Order-only predecessors (connections carrying no field mapping).
    pub dependencies: Vec<NodeKey>,
    pub static_values: Vec<StaticValue>,
    pub variable_refs: Vec<VariableMapping>,
}

impl DependencyInfo {
    /// Every node that must have finished (or been skipped) before this one
    /// may run.
    pub fn execution_predecessors(&self) -> FxHashSet<NodeKey> {
        let mut out: FxHashSet<NodeKey> = FxHashSet::default();
        out.extend(self.inputs.keys().cloned());
        out.extend(self.full_inputs.iter().cloned());
        out.extend(self.indirect_inputs.keys().cloned());
        out.extend(self.full_indirect_inputs.iter().cloned());
        out.extend(self.dependencies.iter().cloned());
        out
    }

    fn mapped_from(&self, key: &NodeKey) -> bool {
        self.inputs.contains_key(key)
            || self.full_inputs.contains(key)
            || self.indirect_inputs.contains_key(key)
            || self.full_indirect_inputs.contains(key)
    }
}

/// Result of resolving one scope: per-node dependency info (the synthetic
/// exit included under [`NodeKey::exit`]) plus the carry-over sources this
/// scope's composite parent must provide.
#[derive(Clone, Debug, Default)]
pub struct ScopeResolution {
    pub per_node: FxHashMap<NodeKey, DependencyInfo>,
    pub carry_overs: Vec<FieldInfo>,
}

/// Resolve every node of `schema` (and its exit). `parent` is the enclosing
/// scope when `schema` is hosted by a composite; references into it produce
/// carry-overs.
pub fn resolve_scope(
    schema: &WorkflowSchema,
    parent: Option<&WorkflowSchema>,
) -> Result<ScopeResolution, ResolverError> {
    let mut resolution = ScopeResolution::default();
    let mut carry_seen: Vec<FieldInfo> = Vec::new();

    for node in &schema.nodes {
        let info = resolve_node(
            &node.key,
            &node.input_sources,
            schema,
            parent,
            &mut carry_seen,
        )?;
        resolution.per_node.insert(node.key.clone(), info);
    }

    let exit_key = NodeKey::exit();
    let exit_info = resolve_node(
        &exit_key,
        &schema.output_sources,
        schema,
        parent,
        &mut carry_seen,
    )?;
    resolution.per_node.insert(exit_key, exit_info);

    resolution.carry_overs = carry_seen;
    Ok(resolution)
}

/// Derive the inner exit's field sources from a composite's output sources:
/// each inner-node output value is surfaced at position
/// `[from_node, ..from_path]` of the inner scope's output, where the
/// composite executor picks it up per index. Intermediate-variable outputs
/// are resolved by the loop executor itself and produce no exit mapping.
pub fn derive_inner_outputs(composite: &NodeSchema) -> Vec<FieldInfo> {
    let mut out = Vec::new();
    for info in &composite.output_sources {
        let Some(r) = info.source.as_ref_source() else {
            continue;
        };
        if r.variable == Some(VarKind::ParentIntermediate) {
            continue;
        }
        let Some(from_node) = &r.from_node else {
            continue;
        };
        let mut segs = vec![from_node.0.clone()];
        segs.extend(r.from_path.segments().iter().cloned());
        out.push(FieldInfo::new(
            FieldPath(segs),
            FieldSource::Ref(FieldRef::node_output(from_node.clone(), r.from_path.clone())),
        ));
    }
    out
}

fn resolve_node(
    consumer: &NodeKey,
    sources: &[FieldInfo],
    schema: &WorkflowSchema,
    parent: Option<&WorkflowSchema>,
    carry_overs: &mut Vec<FieldInfo>,
) -> Result<DependencyInfo, ResolverError> {
    let mut info = DependencyInfo::default();

    for field in sources {
        match &field.source {
            FieldSource::Static { value } => {
                info.static_values.push(StaticValue {
                    to_path: field.path.clone(),
                    value: value.clone(),
                });
            }
            FieldSource::Ref(r) => {
                resolve_ref(consumer, field, r, schema, parent, &mut info, carry_overs)?;
            }
        }
    }

    // Connections that carry no field mapping still order execution.
    for conn in schema.connections_to(consumer) {
        if !info.mapped_from(&conn.from) && !info.dependencies.contains(&conn.from) {
            info.dependencies.push(conn.from.clone());
        }
    }

    trace!(
        consumer = %consumer,
        inputs = info.inputs.len(),
        indirect = info.indirect_inputs.len(),
        deps = info.dependencies.len(),
        "resolved dependencies"
    );

    Ok(info)
}

fn resolve_ref(
    consumer: &NodeKey,
    field: &FieldInfo,
    r: &FieldRef,
    schema: &WorkflowSchema,
    parent: Option<&WorkflowSchema>,
    info: &mut DependencyInfo,
    carry_overs: &mut Vec<FieldInfo>,
) -> Result<(), ResolverError> {
    if let Some(kind) = r.variable {
        info.variable_refs.push(VariableMapping {
            kind,
            from_path: r.from_path.clone(),
            to_path: field.path.clone(),
        });
        return Ok(());
    }

    let from = r.from_node.as_ref().ok_or_else(|| ResolverError::InvalidSource {
        node: consumer.clone(),
        field: field.path.to_string(),
    })?;

    if from == consumer {
        return Err(ResolverError::SelfReference {
            node: consumer.clone(),
        });
    }

    let in_scope = from.is_entry() || schema.node(from).is_some();
    if in_scope {
        let drill = schema
            .node(from)
            .and_then(|producer| compute_drill(producer, &r.from_path));
        let mapping = FieldMapping {
            from_node: from.clone(),
            from_path: r.from_path.clone(),
            to_path: field.path.clone(),
            drill,
        };
        let connected = from.is_entry() || schema.connected(from, consumer);
        let whole = mapping.from_path.is_empty() && mapping.to_path.is_empty();
        match (connected, whole) {
            (true, true) => {
                info.full_inputs.insert(from.clone());
            }
            (true, false) => info.inputs.entry(from.clone()).or_default().push(mapping),
            (false, true) => {
                info.full_indirect_inputs.insert(from.clone());
            }
            (false, false) => info
                .indirect_inputs
                .entry(from.clone())
                .or_default()
                .push(mapping),
        }
        return Ok(());
    }

    // One level up: proxy through the inner entry node and record the
    // carry-over on the hosting composite.
    let parent_scope = parent.ok_or_else(|| ResolverError::UnknownSourceNode {
        node: consumer.clone(),
        from: from.clone(),
    })?;
    if !from.is_entry() && parent_scope.node(from).is_none() {
        return Err(ResolverError::UnknownSourceNode {
            node: consumer.clone(),
            from: from.clone(),
        });
    }

    let joined = r.from_path.proxied_through_entry(from);
    info.inputs
        .entry(NodeKey::entry())
        .or_default()
        .push(FieldMapping {
            from_node: NodeKey::entry(),
            from_path: joined.clone(),
            to_path: field.path.clone(),
            drill: None,
        });

    let carry = FieldInfo::new(
        joined,
        FieldSource::Ref(FieldRef::node_output(from.clone(), r.from_path.clone())),
    );
    if !carry_overs.contains(&carry) {
        carry_overs.push(carry);
    }
    Ok(())
}

/// Find array hops in `from_path` against the producer's declared output
/// types. A segment whose declared type is an array while the path continues
/// with a field name is a drill position (take element 0).
fn compute_drill(producer: &NodeSchema, from_path: &FieldPath) -> Option<ArrayDrill> {
    let segs = from_path.segments();
    if segs.len() < 2 {
        return None;
    }
    let mut positions = Vec::new();
    let mut current: Option<&TypeInfo> = producer.output_types.get(&segs[0]);
    for (i, seg) in segs.iter().enumerate() {
        if i > 0 {
            current = match current {
                Some(TypeInfo::Object { properties }) => properties.get(seg),
                _ => None,
            };
        }
        let Some(t) = current else { break };
        if let TypeInfo::Array { element } = t {
            // only a drill hop when the path keeps descending by field name
            if i + 1 < segs.len() && segs[i + 1].parse::<usize>().is_err() {
                positions.push(i);
                current = Some(element.as_ref());
            }
        }
    }
    if positions.is_empty() {
        None
    } else {
        Some(ArrayDrill { positions })
    }
}
