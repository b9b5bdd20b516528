//! The `LogicalPlan` tree a parsed PromQL query compiles to. Planners
//! consume this tree; [`std::fmt::Display`] renders it back to PromQL text
//! for `PromQlRemoteExec` fragments.
use std::fmt;

/// A single label matcher, e.g. `job="foo"` or `instance=~"h.*"`.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelMatcher {
    pub label: String,
    pub op: MatchOp,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOp {
    Eq,
    Ne,
    Re,
    Nre,
}

impl fmt::Display for MatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Re => "=~",
            Self::Nre => "!~",
        })
    }
}

impl fmt::Display for LabelMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{:?}", self.label, self.op, self.value)
    }
}

impl From<&LabelMatcher> for data_types::ColumnFilter {
    fn from(m: &LabelMatcher) -> Self {
        match m.op {
            MatchOp::Eq => data_types::ColumnFilter::equals(m.label.clone(), m.value.clone()),
            MatchOp::Ne => data_types::ColumnFilter::not_equals(m.label.clone(), m.value.clone()),
            MatchOp::Re => data_types::ColumnFilter::regex(m.label.clone(), m.value.clone()),
            MatchOp::Nre => data_types::ColumnFilter::not_regex(m.label.clone(), m.value.clone()),
        }
    }
}

/// `metric{matchers}`, the leaf of every PromQL expression.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VectorSelector {
    /// The bare metric name, if given positionally (`foo{...}` vs.
    /// `{__name__="foo", ...}`).
    pub metric: Option<String>,
    pub matchers: Vec<LabelMatcher>,
    /// `X offset o`, in milliseconds.
    pub offset_ms: Option<i64>,
}

impl VectorSelector {
    /// All filters this selector implies, including the metric-name
    /// equality if given positionally. `metric_label` names the label the
    /// metric is carried under (`__name__` before dataset rewriting).
    pub fn filters(&self, metric_label: &str) -> Vec<data_types::ColumnFilter> {
        let mut filters: Vec<data_types::ColumnFilter> =
            self.matchers.iter().map(data_types::ColumnFilter::from).collect();
        if let Some(metric) = &self.metric {
            filters.push(data_types::ColumnFilter::equals(metric_label, metric.clone()));
        }
        filters
    }
}

impl fmt::Display for VectorSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(m) = &self.metric {
            write!(f, "{m}")?;
        }
        if !self.matchers.is_empty() {
            write!(f, "{{")?;
            for (i, m) in self.matchers.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{m}")?;
            }
            write!(f, "}}")?;
        }
        if let Some(off) = self.offset_ms {
            write!(f, " offset {}ms", off)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupMod {
    By,
    Without,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Grouping {
    pub modifier: Option<GroupMod>,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorCardinality {
    OneToOne,
    ManyToOne,
    OneToMany,
    ManyToMany,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VectorMatching {
    /// `true` for `on(labels)`, `false` for `ignoring(labels)`.
    pub on: bool,
    pub labels: Vec<String>,
    pub cardinality: Option<VectorCardinality>,
    /// `group_left(include)` / `group_right(include)`.
    pub include: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    And,
    Or,
    Unless,
}

impl BinaryOp {
    pub fn is_set_operator(&self) -> bool {
        matches!(self, Self::And | Self::Or | Self::Unless)
    }

    /// Higher binds tighter. Matches PromQL's precedence table.
    pub fn precedence(&self) -> u8 {
        match self {
            Self::Or => 1,
            Self::And | Self::Unless => 2,
            Self::Eq | Self::Ne | Self::Gt | Self::Lt | Self::Ge | Self::Le => 3,
            Self::Add | Self::Sub => 4,
            Self::Mul | Self::Div | Self::Mod => 5,
            Self::Pow => 6,
        }
    }

    /// `^` is right-associative; everything else is left-associative.
    pub fn right_associative(&self) -> bool {
        matches!(self, Self::Pow)
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
            Self::Pow => "^",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Ge => ">=",
            Self::Le => "<=",
            Self::And => "and",
            Self::Or => "or",
            Self::Unless => "unless",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateOp {
    Sum,
    Avg,
    Count,
    Group,
    Min,
    Max,
    Stddev,
    Stdvar,
    Topk,
    Bottomk,
    CountValues,
    Quantile,
}

impl AggregateOp {
    pub fn takes_param(&self) -> bool {
        matches!(
            self,
            Self::Topk | Self::Bottomk | Self::CountValues | Self::Quantile
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Avg => "avg",
            Self::Count => "count",
            Self::Group => "group",
            Self::Min => "min",
            Self::Max => "max",
            Self::Stddev => "stddev",
            Self::Stdvar => "stdvar",
            Self::Topk => "topk",
            Self::Bottomk => "bottomk",
            Self::CountValues => "count_values",
            Self::Quantile => "quantile",
        }
    }

    /// `true` for ops where two-level reduce == one-level reduce directly
    /// (associative); `avg` needs `(sum, count)` partials to hold the law,
    /// handled by the presenter rather than here.
    pub fn is_directly_associative(&self) -> bool {
        matches!(self, Self::Sum | Self::Count | Self::Min | Self::Max)
    }
}

/// The logical-plan tree. Mirrors the accepted PromQL subset from the root
/// spec's §6 exactly; nothing beyond it (no `@` modifier, see
/// `parser::parse` rejecting it explicitly).
#[derive(Debug, Clone, PartialEq)]
pub enum LogicalPlan {
    VectorSelector(VectorSelector),
    /// `selector[range]`, optionally offset.
    RangeSelector {
        selector: VectorSelector,
        range_ms: i64,
    },
    /// `expr[window:step]`, the subquery form.
    Subquery {
        expr: Box<LogicalPlan>,
        range_ms: i64,
        step_ms: Option<i64>,
        offset_ms: Option<i64>,
    },
    Call {
        func: String,
        args: Vec<LogicalPlan>,
    },
    Aggregate {
        op: AggregateOp,
        expr: Box<LogicalPlan>,
        param: Option<Box<LogicalPlan>>,
        grouping: Grouping,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<LogicalPlan>,
        rhs: Box<LogicalPlan>,
        matching: VectorMatching,
    },
    Unary {
        negative: bool,
        expr: Box<LogicalPlan>,
    },
    NumberLiteral(f64),
    StringLiteral(String),
}

impl LogicalPlan {
    /// Depth of subquery nesting, used to enforce
    /// `TierConfig::max_subquery_nesting_depth`.
    pub fn subquery_depth(&self) -> usize {
        match self {
            Self::Subquery { expr, .. } => 1 + expr.subquery_depth(),
            Self::Call { args, .. } => args.iter().map(Self::subquery_depth).max().unwrap_or(0),
            Self::Aggregate { expr, param, .. } => {
                let e = expr.subquery_depth();
                let p = param.as_ref().map(|p| p.subquery_depth()).unwrap_or(0);
                e.max(p)
            }
            Self::Binary { lhs, rhs, .. } => lhs.subquery_depth().max(rhs.subquery_depth()),
            Self::Unary { expr, .. } => expr.subquery_depth(),
            _ => 0,
        }
    }
}

impl fmt::Display for LogicalPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VectorSelector(vs) => write!(f, "{vs}"),
            Self::RangeSelector { selector, range_ms } => {
                write!(f, "{selector}[{}ms]", range_ms)
            }
            Self::Subquery {
                expr,
                range_ms,
                step_ms,
                offset_ms,
            } => {
                write!(f, "{expr}[{}ms:", range_ms)?;
                if let Some(s) = step_ms {
                    write!(f, "{s}ms")?;
                }
                write!(f, "]")?;
                if let Some(o) = offset_ms {
                    write!(f, " offset {o}ms")?;
                }
                Ok(())
            }
            Self::Call { func, args } => {
                write!(f, "{func}(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ")")
            }
            Self::Aggregate {
                op,
                expr,
                param,
                grouping,
            } => {
                write!(f, "{}(", op.name())?;
                if let Some(p) = param {
                    write!(f, "{p},")?;
                }
                write!(f, "{expr})")?;
                match grouping.modifier {
                    Some(GroupMod::By) => write!(f, " by ({})", grouping.labels.join(","))?,
                    Some(GroupMod::Without) => {
                        write!(f, " without ({})", grouping.labels.join(","))?
                    }
                    None => {}
                }
                Ok(())
            }
            Self::Binary {
                op,
                lhs,
                rhs,
                matching,
            } => {
                write!(f, "({lhs}) {op}")?;
                if !matching.labels.is_empty() {
                    let kw = if matching.on { "on" } else { "ignoring" };
                    write!(f, " {kw}({})", matching.labels.join(","))?;
                }
                if !matching.include.is_empty() {
                    let kw = match matching.cardinality {
                        Some(VectorCardinality::ManyToOne) => "group_left",
                        _ => "group_right",
                    };
                    write!(f, " {kw}({})", matching.include.join(","))?;
                }
                write!(f, " ({rhs})")
            }
            Self::Unary { negative, expr } => {
                write!(f, "{}{expr}", if *negative { "-" } else { "+" })
            }
            Self::NumberLiteral(n) => write!(f, "{n}"),
            Self::StringLiteral(s) => write!(f, "{s:?}"),
        }
    }
}
