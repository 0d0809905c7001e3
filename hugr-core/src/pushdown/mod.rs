//! Push-down partitioning: maximal single-source subtrees whose operators the
//! owning source supports execute remotely; everything else runs on the
//! central engine, pulling remote subtrees as virtual tables.

use indexmap::IndexMap;

use crate::query_plan::PlanNode;
use crate::source::Capabilities;

/// Where a (sub)tree executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    Remote { source: String },
    Local,
}

impl Placement {
    fn remote_source(&self) -> Option<&str> {
        match self {
            Placement::Remote { source } => Some(source),
            Placement::Local => None,
        }
    }
}

/// A maximal subtree annotated for remote execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFragment {
    pub source: String,
    /// Plan display of the subtree, for diagnostics and logging.
    pub subtree: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionedPlan {
    pub placement: Placement,
    pub fragments: Vec<RemoteFragment>,
}

/// Walks the plan bottom-up and partitions it between remote sources and the
/// central engine. A subtree joining across sources demotes its whole
/// ancestor chain to local execution; only its single-source leaves stay
/// pushable.
pub fn partition(
    plan: &PlanNode,
    capabilities: &IndexMap<String, Capabilities>,
) -> PartitionedPlan {
    let mut fragments = Vec::new();
    let placement = place(plan, capabilities, &mut fragments);
    if let Placement::Remote { source } = &placement {
        fragments.push(RemoteFragment {
            source: source.clone(),
            subtree: plan.to_string(),
        });
    }
    PartitionedPlan {
        placement,
        fragments,
    }
}

fn place(
    plan: &PlanNode,
    capabilities: &IndexMap<String, Capabilities>,
    fragments: &mut Vec<RemoteFragment>,
) -> Placement {
    let caps = |source: &str| capabilities.get(source).copied().unwrap_or_default();
    match plan {
        PlanNode::Scan(scan) => {
            if scan.source.is_empty() {
                return Placement::Local;
            }
            let c = caps(&scan.source);
            let supported = (!scan.has_filter || c.filter_pushdown)
                && (!scan.has_sort || c.order_by_pushdown)
                && (!scan.has_limit || c.limit_pushdown);
            if supported {
                Placement::Remote {
                    source: scan.source.clone(),
                }
            } else {
                Placement::Local
            }
        }
        // A function always runs where it is defined.
        PlanNode::FunctionScan(node) => Placement::Remote {
            source: node.source.clone(),
        },
        PlanNode::Join(node) => {
            let parent = place(&node.parent, capabilities, fragments);
            let child = place(&node.child, capabilities, fragments);
            if !node.cross_source {
                if let (Some(left), Some(right)) =
                    (parent.remote_source(), child.remote_source())
                {
                    if left == right && caps(left).join_pushdown {
                        return Placement::Remote {
                            source: left.to_owned(),
                        };
                    }
                }
            }
            demote(&parent, &node.parent, fragments);
            demote(&child, &node.child, fragments);
            Placement::Local
        }
        PlanNode::SpatialJoin(node) => {
            let parent = place(&node.parent, capabilities, fragments);
            let child = place(&node.child, capabilities, fragments);
            if !node.cross_source {
                if let (Some(left), Some(right)) =
                    (parent.remote_source(), child.remote_source())
                {
                    let c = caps(left);
                    if left == right && c.join_pushdown && c.geometry {
                        return Placement::Remote {
                            source: left.to_owned(),
                        };
                    }
                }
            }
            demote(&parent, &node.parent, fragments);
            demote(&child, &node.child, fragments);
            Placement::Local
        }
        PlanNode::Aggregate(node) => {
            let input = place(&node.input, capabilities, fragments);
            if let Some(source) = input.remote_source() {
                if caps(source).aggregate_pushdown {
                    return Placement::Remote {
                        source: source.to_owned(),
                    };
                }
            }
            demote(&input, &node.input, fragments);
            Placement::Local
        }
        PlanNode::BucketAggregate(node) => {
            let input = place(&node.input, capabilities, fragments);
            if let Some(source) = input.remote_source() {
                let c = caps(source);
                if c.aggregate_pushdown && c.time_buckets {
                    return Placement::Remote {
                        source: source.to_owned(),
                    };
                }
            }
            demote(&input, &node.input, fragments);
            Placement::Local
        }
        PlanNode::SubAggregate(node) => {
            let child = place(&node.child, capabilities, fragments);
            if let Some(source) = child.remote_source() {
                if caps(source).aggregate_pushdown {
                    return Placement::Remote {
                        source: source.to_owned(),
                    };
                }
            }
            demote(&child, &node.child, fragments);
            Placement::Local
        }
        // H3 cell synthesis needs the engine's h3 extension.
        PlanNode::H3Overlay(node) => {
            for input in &node.inputs {
                let placement = place(input, capabilities, fragments);
                demote(&placement, input, fragments);
            }
            Placement::Local
        }
        PlanNode::LimitOffset(node) => {
            let input = place(&node.input, capabilities, fragments);
            if let Some(source) = input.remote_source() {
                if caps(source).limit_pushdown {
                    return Placement::Remote {
                        source: source.to_owned(),
                    };
                }
            }
            demote(&input, &node.input, fragments);
            Placement::Local
        }
        PlanNode::DistinctOn(node) => {
            let input = place(&node.input, capabilities, fragments);
            if let Some(source) = input.remote_source() {
                if caps(source).order_by_pushdown {
                    return Placement::Remote {
                        source: source.to_owned(),
                    };
                }
            }
            demote(&input, &node.input, fragments);
            Placement::Local
        }
    }
}

/// When a parent localizes, its remote children become maximal fragments.
fn demote(placement: &Placement, node: &PlanNode, fragments: &mut Vec<RemoteFragment>) {
    if let Placement::Remote { source } = placement {
        fragments.push(RemoteFragment {
            source: source.clone(),
            subtree: node.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::query_plan::JoinClass;
    use crate::query_plan::JoinNode;
    use crate::query_plan::ScanNode;
    use crate::source::SourceKind;

    fn scan(source: &str, object: &str, filtered: bool) -> PlanNode {
        ScanNode {
            source: source.to_owned(),
            object: object.to_owned(),
            relation: object.to_owned(),
            alias: "t0".to_owned(),
            has_filter: filtered,
            has_sort: false,
            has_limit: false,
        }
        .into()
    }

    fn postgres_caps() -> IndexMap<String, Capabilities> {
        let mut caps = IndexMap::new();
        caps.insert("shop".to_owned(), Capabilities::for_kind(SourceKind::Postgres));
        caps.insert("auth".to_owned(), Capabilities::for_kind(SourceKind::Postgres));
        caps.insert("api".to_owned(), Capabilities::for_kind(SourceKind::Http));
        caps
    }

    #[test]
    fn single_source_join_executes_remotely() {
        let plan: PlanNode = JoinNode {
            parent: scan("shop", "customers", true),
            child: scan("shop", "orders", false),
            kind: JoinClass::Left,
            cross_source: false,
        }
        .into();
        let partitioned = partition(&plan, &postgres_caps());
        assert_eq!(
            partitioned.placement,
            Placement::Remote {
                source: "shop".to_owned()
            }
        );
        assert_eq!(partitioned.fragments.len(), 1);
    }

    #[test]
    fn cross_source_join_demotes_to_local_but_keeps_leaf_fragments() {
        let plan: PlanNode = JoinNode {
            parent: scan("shop", "users", true),
            child: scan("auth", "sessions", true),
            kind: JoinClass::Left,
            cross_source: true,
        }
        .into();
        let partitioned = partition(&plan, &postgres_caps());
        assert_eq!(partitioned.placement, Placement::Local);
        let sources: Vec<_> = partitioned
            .fragments
            .iter()
            .map(|f| f.source.as_str())
            .collect();
        assert_eq!(sources, vec!["shop", "auth"]);
    }

    #[test]
    fn filtered_scan_on_http_source_runs_locally() {
        let partitioned = partition(&scan("api", "sessions", true), &postgres_caps());
        assert_eq!(partitioned.placement, Placement::Local);
        assert!(partitioned.fragments.is_empty());
    }

    #[test]
    fn unfiltered_scan_on_http_source_is_remote() {
        // The whole-request boundary: an HTTP source can always answer a bare
        // scan of itself.
        let partitioned = partition(&scan("api", "sessions", false), &postgres_caps());
        assert_eq!(
            partitioned.placement,
            Placement::Remote {
                source: "api".to_owned()
            }
        );
    }
}
