use std::fmt;

use super::*;
use crate::display_helpers::State;
use crate::display_helpers::write_indented_lines;

impl fmt::Display for PlanNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_indented(&mut State::new(f))
    }
}

impl PlanNode {
    fn write_indented(&self, state: &mut State<'_, '_>) -> fmt::Result {
        match self {
            Self::Scan(node) => node.write_indented(state),
            Self::Join(node) => node.write_indented(state),
            Self::SpatialJoin(node) => node.write_indented(state),
            Self::Aggregate(node) => node.write_indented(state),
            Self::BucketAggregate(node) => node.write_indented(state),
            Self::SubAggregate(node) => node.write_indented(state),
            Self::FunctionScan(node) => node.write_indented(state),
            Self::H3Overlay(node) => node.write_indented(state),
            Self::LimitOffset(node) => node.write_indented(state),
            Self::DistinctOn(node) => node.write_indented(state),
        }
    }
}

impl ScanNode {
    fn write_indented(&self, state: &mut State<'_, '_>) -> fmt::Result {
        state.write(format_args!(
            "Scan(source: {:?}, object: {:?}",
            self.source, self.object
        ))?;
        if self.has_filter {
            state.write(", filter")?;
        }
        if self.has_sort {
            state.write(", sort")?;
        }
        if self.has_limit {
            state.write(", limit")?;
        }
        state.write(")")
    }
}

impl JoinNode {
    fn write_indented(&self, state: &mut State<'_, '_>) -> fmt::Result {
        let kind = match self.kind {
            JoinClass::Inner => "inner",
            JoinClass::Left => "left",
        };
        state.write(format_args!("Join(kind: {kind}"))?;
        if self.cross_source {
            state.write(", cross-source")?;
        }
        state.write(") {")?;
        state.indent()?;
        self.parent.write_indented(state)?;
        state.write(",")?;
        state.new_line()?;
        self.child.write_indented(state)?;
        state.dedent()?;
        state.write("}")
    }
}

impl SpatialJoinNode {
    fn write_indented(&self, state: &mut State<'_, '_>) -> fmt::Result {
        state.write(format_args!("SpatialJoin(relation: {:?}", self.relation))?;
        if let Some(buffer) = self.buffer {
            state.write(format_args!(", buffer: {buffer}"))?;
        }
        if self.cross_source {
            state.write(", cross-source")?;
        }
        state.write(") {")?;
        state.indent()?;
        self.parent.write_indented(state)?;
        state.write(",")?;
        state.new_line()?;
        self.child.write_indented(state)?;
        state.dedent()?;
        state.write("}")
    }
}

impl AggregateNode {
    fn write_indented(&self, state: &mut State<'_, '_>) -> fmt::Result {
        state.write(format_args!(
            "Aggregate({}) {{",
            self.aggregations.join(", ")
        ))?;
        state.indent()?;
        self.input.write_indented(state)?;
        state.dedent()?;
        state.write("}")
    }
}

impl BucketAggregateNode {
    fn write_indented(&self, state: &mut State<'_, '_>) -> fmt::Result {
        state.write(format_args!(
            "BucketAggregate(keys: [{}], aggregations: [{}]) {{",
            self.keys.join(", "),
            self.aggregations.join(", ")
        ))?;
        state.indent()?;
        self.input.write_indented(state)?;
        state.dedent()?;
        state.write("}")
    }
}

impl SubAggregateNode {
    fn write_indented(&self, state: &mut State<'_, '_>) -> fmt::Result {
        state.write(format_args!("SubAggregate(relation: {:?}) {{", self.relation))?;
        state.indent()?;
        self.child.write_indented(state)?;
        state.dedent()?;
        state.write("}")
    }
}

impl FunctionScanNode {
    fn write_indented(&self, state: &mut State<'_, '_>) -> fmt::Result {
        state.write(format_args!(
            "FunctionScan(source: {:?}, function: {:?}{})",
            self.source,
            self.function,
            if self.returns_set { ", set" } else { "" }
        ))
    }
}

impl H3OverlayNode {
    fn write_indented(&self, state: &mut State<'_, '_>) -> fmt::Result {
        state.write(format_args!(
            "H3Overlay(resolution: {}{}) {{",
            self.resolution,
            if self.inner { ", inner" } else { "" }
        ))?;
        write_indented_lines(state, &self.inputs, |state, input| {
            input.write_indented(state)
        })?;
        state.write("}")
    }
}

impl LimitOffsetNode {
    fn write_indented(&self, state: &mut State<'_, '_>) -> fmt::Result {
        state.write("Limit(")?;
        if let Some(limit) = self.limit {
            state.write(format_args!("limit: {limit}"))?;
        }
        if let Some(offset) = self.offset {
            if self.limit.is_some() {
                state.write(", ")?;
            }
            state.write(format_args!("offset: {offset}"))?;
        }
        state.write(") {")?;
        state.indent()?;
        self.input.write_indented(state)?;
        state.dedent()?;
        state.write("}")
    }
}

impl DistinctOnNode {
    fn write_indented(&self, state: &mut State<'_, '_>) -> fmt::Result {
        state.write(format_args!("DistinctOn({}) {{", self.keys.join(", ")))?;
        state.indent()?;
        self.input.write_indented(state)?;
        state.dedent()?;
        state.write("}")
    }
}
