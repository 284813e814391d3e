//! Output emitter node.
//!
//! Renders a `{{variable}}` template over mapped input fields into a single
//! `output` string. In streaming mode the node consumes its input as a chunk
//! stream and renders template parts strictly in order: literal parts flush
//! immediately, stream-typed variables forward their deltas as they arrive,
//! and value-typed variables wait until their value lands or their producer
//! finishes. A producer that finishes without supplying a field backfills
//! the field's zero value; a producer skipped by branch routing renders as
//! nothing at all.

use async_trait::async_trait;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;

use crate::resolver::{FieldStreamType, SourceInfo, StreamContext, resolve_dynamic};
use crate::runtime::context::ExecutionContext;
use crate::schema::config::EmitterConfig;
use crate::types::NodeKey;
use crate::utils::ValueMap;

use super::template::{Rendered, TemplatePart, lookup, parse_template, render_value, render_with};
use super::{
    FINISH_MARKER, NodeError, NodeExecutor, NodeOutcome, StreamItem, StreamReader, merge_delta,
    trim_finish_markers,
};

/// The emitter's single output field.
pub const OUTPUT_KEY: &str = "output";

pub struct EmitterExecutor {
    config: EmitterConfig,
    /// Compile-time source tree of this node's inputs.
    sources: FxHashMap<String, SourceInfo>,
    /// Source trees of every aggregator in scope, for settling maybe-streams.
    aggregator_sources: Arc<FxHashMap<NodeKey, FxHashMap<String, SourceInfo>>>,
}

impl EmitterExecutor {
    #[must_use]
    pub fn new(
        config: EmitterConfig,
        sources: FxHashMap<String, SourceInfo>,
        aggregator_sources: Arc<FxHashMap<NodeKey, FxHashMap<String, SourceInfo>>>,
    ) -> Self {
        EmitterExecutor {
            config,
            sources,
            aggregator_sources,
        }
    }

    /// Settle maybe-stream leaves and mark skipped producers for this run.
    fn resolved_sources(
        &self,
        ctx: &ExecutionContext,
    ) -> Result<FxHashMap<String, SourceInfo>, NodeError> {
        let (choices, skipped) = ctx
            .state
            .with(|state| (state.group_choices.clone(), state.skipped.clone()));
        let stream_ctx = StreamContext {
            aggregator_sources: &self.aggregator_sources,
            group_choices: &choices,
            skipped: &skipped,
        };
        Ok(resolve_dynamic(&self.sources, &stream_ctx)?)
    }
}

#[async_trait]
impl NodeExecutor for EmitterExecutor {
    async fn invoke(
        &self,
        ctx: &ExecutionContext,
        mut input: ValueMap,
    ) -> Result<NodeOutcome, NodeError> {
        let resolved = self.resolved_sources(ctx)?;
        trim_finish_markers(&mut input);

        let text = render_with(&self.config.template, |part| {
            let TemplatePart::Variable { segments, .. } = part else {
                return Rendered::Missing;
            };
            if find_leaf(&resolved, segments)
                .is_some_and(|leaf| leaf.field_type == FieldStreamType::Skipped)
            {
                return Rendered::Skipped;
            }
            match lookup(&input, segments) {
                Some(Value::Null) | None => Rendered::Missing,
                Some(value) => Rendered::Found(value.clone()),
            }
        });

        if self.config.streaming && !text.is_empty() {
            ctx.emit_delta(OUTPUT_KEY, json!(text));
        }
        let mut output = ValueMap::new();
        output.insert(OUTPUT_KEY.to_string(), json!(text));
        Ok(NodeOutcome::Output(output))
    }

    async fn transform(
        &self,
        ctx: &ExecutionContext,
        stream: StreamReader,
    ) -> Result<NodeOutcome, NodeError> {
        let resolved = self.resolved_sources(ctx)?;
        let mut render = StreamRender {
            ctx,
            stream,
            acc: ValueMap::new(),
            finished: FxHashSet::default(),
            open: true,
            rendered: String::new(),
        };

        for part in parse_template(&self.config.template) {
            match &part {
                TemplatePart::Literal(text) => render.emit(text),
                TemplatePart::Variable { raw, segments } => {
                    match find_leaf(&resolved, segments) {
                        None => render.emit_literal(raw),
                        Some(leaf) => match leaf.field_type {
                            FieldStreamType::Skipped => {}
                            FieldStreamType::Stream => render.stream_part(leaf, segments).await,
                            _ => render.value_part(leaf, raw, segments).await,
                        },
                    }
                }
            }
        }
        debug!(node = %ctx.node_key, chars = render.rendered.len(), "emitter stream rendered");

        let mut output = ValueMap::new();
        output.insert(OUTPUT_KEY.to_string(), json!(render.rendered));
        Ok(NodeOutcome::Output(output))
    }
}

/// Walk a source tree along template segments to the governing leaf.
fn find_leaf<'a>(
    tree: &'a FxHashMap<String, SourceInfo>,
    segments: &[String],
) -> Option<&'a SourceInfo> {
    let (first, rest) = segments.split_first()?;
    let mut current = tree.get(first)?;
    for seg in rest {
        if !current.is_intermediate {
            break;
        }
        current = current.sub_sources.get(seg)?;
    }
    Some(current)
}

struct StreamRender<'a> {
    ctx: &'a ExecutionContext,
    stream: StreamReader,
    acc: ValueMap,
    finished: FxHashSet<NodeKey>,
    open: bool,
    rendered: String,
}

impl StreamRender<'_> {
    fn emit(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.rendered.push_str(text);
        self.ctx.emit_delta(OUTPUT_KEY, json!(text));
    }

    fn emit_literal(&mut self, raw: &str) {
        self.emit(&format!("{{{{{raw}}}}}"));
    }

    async fn pump(&mut self) {
        match self.stream.next().await {
            Some(StreamItem::Delta(delta)) => merge_delta(&mut self.acc, delta),
            Some(StreamItem::SourceFinished(node)) => {
                self.finished.insert(node);
            }
            None => self.open = false,
        }
    }

    fn producer_finished(&self, leaf: &SourceInfo) -> bool {
        leaf.from_node
            .as_ref()
            .is_some_and(|node| self.finished.contains(node))
    }

    /// Current text of a stream-typed string field: the accumulated value
    /// with finish markers stripped, plus whether a marker was seen.
    fn current_text(&self, segments: &[String]) -> (String, bool) {
        match lookup(&self.acc, segments) {
            Some(Value::String(s)) => {
                let done = s.contains(FINISH_MARKER);
                (s.replace(FINISH_MARKER, ""), done)
            }
            Some(Value::Null) | None => (String::new(), false),
            Some(other) => (render_value(other), false),
        }
    }

    /// Forward a stream field's text incrementally while it grows.
    async fn stream_part(&mut self, leaf: &SourceInfo, segments: &[String]) {
        let mut emitted = 0usize;
        loop {
            let (text, done) = self.current_text(segments);
            if text.len() > emitted {
                let delta = text[emitted..].to_string();
                self.emit(&delta);
                emitted = text.len();
            }
            if done || self.producer_finished(leaf) || !self.open {
                break;
            }
            self.pump().await;
        }
    }

    /// Wait for a whole value, backfilling the zero value when the producer
    /// finishes without supplying it.
    async fn value_part(&mut self, leaf: &SourceInfo, raw: &str, segments: &[String]) {
        loop {
            if let Some(value) = lookup(&self.acc, segments) {
                if !value.is_null() {
                    let mut text = render_value(value);
                    if text.contains(FINISH_MARKER) {
                        text = text.replace(FINISH_MARKER, "");
                    }
                    self.emit(&text);
                    return;
                }
            }
            if self.producer_finished(leaf) || !self.open {
                match &leaf.type_info {
                    Some(type_info) => {
                        let zero = type_info.zero();
                        let text = render_value(&zero);
                        self.emit(&text);
                    }
                    None => self.emit_literal(raw),
                }
                return;
            }
            self.pump().await;
        }
    }
}
