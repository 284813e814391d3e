//! Streaming field classification.
//!
//! Every field source of a stream-consuming node is classified before the
//! run starts: does its value arrive whole (`NotStream`), incrementally
//! (`Stream`), is it undecidable until an aggregator picks a candidate at
//! run time (`MaybeStream`), or was its producer cut off by branch routing
//! (`Skipped`)?
//!
//! Static classification walks the schema; `MaybeStream` leaves are settled
//! at run time by [`resolve_dynamic`] using the group choices an aggregator
//! recorded into run state.

use rustc_hash::{FxHashMap, FxHashSet};

use super::ResolverError;
use crate::schema::{FieldInfo, FieldSource, NodeConfig, TypeInfo, WorkflowSchema};
use crate::types::{FieldPath, NodeKey};

/// Stream classification of one field source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FieldStreamType {
    Stream,
    NotStream,
    /// Depends on an aggregator's run-time group choice.
    MaybeStream,
    /// Producer sits on an unselected branch; the value never arrives.
    Skipped,
}

/// One node of a consumer's source tree. Intermediate nodes group nested
/// paths; leaves carry the classification and the producing position.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceInfo {
    pub is_intermediate: bool,
    pub field_type: FieldStreamType,
    pub from_node: Option<NodeKey>,
    pub from_path: FieldPath,
    pub type_info: Option<TypeInfo>,
    pub sub_sources: FxHashMap<String, SourceInfo>,
}

impl SourceInfo {
    fn intermediate() -> Self {
        SourceInfo {
            is_intermediate: true,
            field_type: FieldStreamType::NotStream,
            from_node: None,
            from_path: FieldPath::new(),
            type_info: None,
            sub_sources: FxHashMap::default(),
        }
    }

    fn leaf(
        field_type: FieldStreamType,
        from_node: Option<NodeKey>,
        from_path: FieldPath,
        type_info: Option<TypeInfo>,
    ) -> Self {
        SourceInfo {
            is_intermediate: false,
            field_type,
            from_node,
            from_path,
            type_info,
            sub_sources: FxHashMap::default(),
        }
    }

    /// Whether this source (leaf) originates from `node`.
    #[must_use]
    pub fn from_node_key(&self, node: &NodeKey) -> bool {
        self.from_node.as_ref() == Some(node)
    }
}

/// Classify the field at `path` of `producer`'s output.
///
/// When the scope has no streaming producer at all, everything is
/// `NotStream` and classification short-circuits.
pub fn classify_field(
    producer: &NodeKey,
    path: &FieldPath,
    schema: &WorkflowSchema,
) -> Result<FieldStreamType, ResolverError> {
    if !schema.requires_streaming() {
        return Ok(FieldStreamType::NotStream);
    }
    if producer.is_entry() {
        return Ok(FieldStreamType::NotStream);
    }
    let node = schema
        .node(producer)
        .ok_or_else(|| ResolverError::UnknownSourceNode {
            node: NodeKey::exit(),
            from: producer.clone(),
        })?;

    match &node.config {
        NodeConfig::OutputEmitter(cfg) => Ok(if cfg.streaming {
            FieldStreamType::Stream
        } else {
            FieldStreamType::NotStream
        }),
        NodeConfig::VariableAggregator(cfg) => classify_aggregator_field(node, cfg, path, schema),
        NodeConfig::SubWorkflow(_) => classify_passthrough(node, path),
        _ => Ok(if node.stream.can_generate_stream {
            FieldStreamType::Stream
        } else {
            FieldStreamType::NotStream
        }),
    }
}

/// Aggregator outputs: a two-segment path asks about one candidate, a
/// one-segment path about a whole group (stream only when every candidate
/// streams, not-stream only when none does, otherwise maybe).
fn classify_aggregator_field(
    node: &crate::schema::NodeSchema,
    cfg: &crate::schema::AggregatorConfig,
    path: &FieldPath,
    schema: &WorkflowSchema,
) -> Result<FieldStreamType, ResolverError> {
    let segs = path.segments();
    match segs.len() {
        2 => {
            for info in &node.input_sources {
                if info.path.segments() == segs {
                    let Some(r) = info.source.as_ref_source() else {
                        return Ok(FieldStreamType::NotStream);
                    };
                    let Some(from) = &r.from_node else {
                        return Ok(FieldStreamType::NotStream);
                    };
                    return classify_field(from, &r.from_path, schema);
                }
            }
            Ok(FieldStreamType::NotStream)
        }
        1 => {
            if cfg.group_len(&segs[0]).is_none() {
                return Err(ResolverError::InternalInvariant(format!(
                    "aggregator '{}' has no group '{}'",
                    node.key, segs[0]
                )));
            }
            let mut stream_count = 0usize;
            let mut not_stream_count = 0usize;
            for info in &node.input_sources {
                if info.path.segments().first() != Some(&segs[0]) {
                    continue;
                }
                let Some(r) = info.source.as_ref_source() else {
                    not_stream_count += 1;
                    continue;
                };
                let Some(from) = &r.from_node else {
                    not_stream_count += 1;
                    continue;
                };
                match classify_field(from, &r.from_path, schema)? {
                    FieldStreamType::MaybeStream => return Ok(FieldStreamType::MaybeStream),
                    FieldStreamType::Stream => stream_count += 1,
                    _ => not_stream_count += 1,
                }
            }
            if stream_count > 0 && not_stream_count == 0 {
                Ok(FieldStreamType::Stream)
            } else if stream_count == 0 {
                Ok(FieldStreamType::NotStream)
            } else {
                Ok(FieldStreamType::MaybeStream)
            }
        }
        n => Err(ResolverError::InternalInvariant(format!(
            "aggregator output path length must be 1 or 2, got {n}"
        ))),
    }
}

/// Pass-through nodes surface inner fields; recurse into the hosted scope's
/// output sources.
fn classify_passthrough(
    node: &crate::schema::NodeSchema,
    path: &FieldPath,
) -> Result<FieldStreamType, ResolverError> {
    let Some(sub) = node.sub_schema.as_deref() else {
        return Ok(FieldStreamType::NotStream);
    };
    for info in &node.output_sources {
        if info.path == *path {
            let Some(r) = info.source.as_ref_source() else {
                return Ok(FieldStreamType::NotStream);
            };
            let Some(from) = &r.from_node else {
                return Ok(FieldStreamType::NotStream);
            };
            return classify_field(from, &r.from_path, sub);
        }
    }
    Ok(FieldStreamType::NotStream)
}

/// Build the [`SourceInfo`] tree for a consumer's declared input sources.
pub fn build_source_info(
    sources: &[FieldInfo],
    consumer_types: &FxHashMap<String, TypeInfo>,
    schema: &WorkflowSchema,
) -> Result<FxHashMap<String, SourceInfo>, ResolverError> {
    let mut out: FxHashMap<String, SourceInfo> = FxHashMap::default();
    for info in sources {
        let segs = info.path.segments();
        let Some(first) = segs.first() else { continue };

        let type_info = consumer_types
            .get(first)
            .and_then(|t| t.at_path(&FieldPath::from(&segs[1..])))
            .cloned();

        let leaf = match &info.source {
            FieldSource::Static { .. } => {
                SourceInfo::leaf(FieldStreamType::NotStream, None, FieldPath::new(), type_info)
            }
            FieldSource::Ref(r) => match (&r.from_node, r.variable) {
                (_, Some(_)) | (None, None) => SourceInfo::leaf(
                    FieldStreamType::NotStream,
                    None,
                    r.from_path.clone(),
                    type_info,
                ),
                (Some(from), None) => {
                    let field_type = classify_field(from, &r.from_path, schema)?;
                    SourceInfo::leaf(
                        field_type,
                        Some(from.clone()),
                        r.from_path.clone(),
                        type_info,
                    )
                }
            },
        };

        if segs.len() == 1 {
            out.insert(first.clone(), leaf);
        } else {
            let mut current = out
                .entry(first.clone())
                .or_insert_with(SourceInfo::intermediate);
            for seg in &segs[1..segs.len() - 1] {
                current = current
                    .sub_sources
                    .entry(seg.clone())
                    .or_insert_with(SourceInfo::intermediate);
            }
            current
                .sub_sources
                .insert(segs[segs.len() - 1].clone(), leaf);
        }
    }
    Ok(out)
}

/// Run-time inputs needed to settle `MaybeStream` leaves and mark skipped
/// producers.
pub struct StreamContext<'a> {
    /// Source trees of every aggregator in scope, built at compile time.
    pub aggregator_sources: &'a FxHashMap<NodeKey, FxHashMap<String, SourceInfo>>,
    /// Group choice per aggregator recorded during the run (`-1` = all
    /// candidates null or skipped).
    pub group_choices: &'a FxHashMap<NodeKey, FxHashMap<String, i64>>,
    /// Nodes cut off by branch routing this run.
    pub skipped: &'a FxHashSet<NodeKey>,
}

/// Produce a resolved copy of a source tree: `MaybeStream` leaves settle
/// through recorded group choices and skipped producers mark `Skipped`.
pub fn resolve_dynamic(
    infos: &FxHashMap<String, SourceInfo>,
    ctx: &StreamContext<'_>,
) -> Result<FxHashMap<String, SourceInfo>, ResolverError> {
    let mut out = FxHashMap::default();
    for (k, info) in infos {
        out.insert(k.clone(), resolve_one(info, ctx)?);
    }
    Ok(out)
}

fn resolve_one(info: &SourceInfo, ctx: &StreamContext<'_>) -> Result<SourceInfo, ResolverError> {
    let mut resolved = info.clone();
    if info.is_intermediate {
        resolved.sub_sources = resolve_dynamic(&info.sub_sources, ctx)?;
        return Ok(resolved);
    }
    if let Some(from) = &info.from_node {
        if ctx.skipped.contains(from) {
            resolved.field_type = FieldStreamType::Skipped;
            return Ok(resolved);
        }
    }
    if info.field_type == FieldStreamType::MaybeStream {
        let from = info
            .from_node
            .clone()
            .ok_or_else(|| ResolverError::InternalInvariant(
                "maybe-stream leaf without a producer".to_string(),
            ))?;
        resolved.field_type = settle_maybe(&from, &info.from_path, ctx)?;
    }
    Ok(resolved)
}

/// Follow a run-time group choice to its chosen candidate, recursing while
/// the candidate itself is another aggregator group.
fn settle_maybe(
    aggregator: &NodeKey,
    path: &FieldPath,
    ctx: &StreamContext<'_>,
) -> Result<FieldStreamType, ResolverError> {
    let segs = path.segments();
    if segs.len() != 1 {
        return Err(ResolverError::InternalInvariant(format!(
            "dynamic stream resolution expects a single group segment, got '{path}'"
        )));
    }
    let group = &segs[0];

    let choice = ctx
        .group_choices
        .get(aggregator)
        .and_then(|m| m.get(group))
        .copied()
        .ok_or_else(|| ResolverError::MissingGroupChoice {
            node: aggregator.clone(),
            group: group.clone(),
        })?;
    if choice < 0 {
        return Ok(FieldStreamType::NotStream);
    }

    let candidates = ctx
        .aggregator_sources
        .get(aggregator)
        .and_then(|tree| tree.get(group))
        .ok_or_else(|| ResolverError::InternalInvariant(format!(
            "no source tree for aggregator '{aggregator}' group '{group}'"
        )))?;
    let candidate = candidates
        .sub_sources
        .get(&choice.to_string())
        .ok_or_else(|| ResolverError::InternalInvariant(format!(
            "aggregator '{aggregator}' group '{group}' has no candidate {choice}"
        )))?;

    match candidate.field_type {
        FieldStreamType::MaybeStream => {
            let from = candidate.from_node.clone().ok_or_else(|| {
                ResolverError::InternalInvariant(
                    "maybe-stream candidate without a producer".to_string(),
                )
            })?;
            settle_maybe(&from, &candidate.from_path, ctx)
        }
        other => {
            if let Some(from) = &candidate.from_node {
                if ctx.skipped.contains(from) {
                    return Ok(FieldStreamType::Skipped);
                }
            }
            Ok(other)
        }
    }
}
