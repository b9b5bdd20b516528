//! A `nom`-based recursive-descent parser for the PromQL subset accepted
//! by the root spec's §6: instant/range vector selectors with equality,
//! regex and negation filters, the offset modifier, subqueries `[W:S]`,
//! arithmetic/comparison/set binary operators, the aggregation operators
//! and grouping modifiers, and range/instant function calls. The `@`
//! modifier is explicitly out of scope and rejected.
use nom::{
    branch::alt,
    bytes::complete::{escaped, is_not, tag, tag_no_case, take_while, take_while1},
    character::complete::{alpha1, alphanumeric1, char, digit1, multispace0, one_of},
    combinator::{map, map_res, opt, recognize, value},
    multi::{separated_list0, separated_list1},
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};
use once_cell::sync::Lazy;
use snafu::Snafu;
use std::collections::HashSet;

use crate::ast::*;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to parse PromQL expression: {message}"))]
    Parse { message: String },

    #[snafu(display("the '@' modifier is not supported"))]
    AtModifierUnsupported,

    #[snafu(display("trailing input after expression: {remainder}"))]
    TrailingInput { remainder: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

static AGGREGATE_NAMES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "sum",
        "avg",
        "count",
        "group",
        "min",
        "max",
        "stddev",
        "stdvar",
        "topk",
        "bottomk",
        "count_values",
        "quantile",
    ]
    .into_iter()
    .collect()
});

/// Parse a complete PromQL expression into a [`LogicalPlan`].
pub fn parse(input: &str) -> Result<LogicalPlan> {
    if input.contains('@') {
        return Err(Error::AtModifierUnsupported);
    }
    let (rest, plan) = ws(expr)(input).map_err(|e| Error::Parse {
        message: e.to_string(),
    })?;
    let rest = rest.trim();
    if !rest.is_empty() {
        return Err(Error::TrailingInput {
            remainder: rest.to_string(),
        });
    }
    Ok(plan)
}

fn ws<'a, F, O>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        alt((alpha1, tag("_"), tag(":"))),
        take_while(|c: char| c.is_alphanumeric() || c == '_' || c == ':'),
    ))(input)
}

fn quoted_string(input: &str) -> IResult<&str, String> {
    alt((
        delimited(
            char('"'),
            map(
                opt(escaped(is_not("\\\""), '\\', one_of("\"\\nrt"))),
                |s: Option<&str>| s.unwrap_or("").to_string(),
            ),
            char('"'),
        ),
        delimited(
            char('\''),
            map(
                opt(escaped(is_not("\\'"), '\\', one_of("'\\nrt"))),
                |s: Option<&str>| s.unwrap_or("").to_string(),
            ),
            char('\''),
        ),
    ))(input)
}

fn number_literal(input: &str) -> IResult<&str, f64> {
    map_res(
        recognize(tuple((
            opt(char('-')),
            digit1,
            opt(pair(char('.'), digit1)),
        ))),
        |s: &str| s.parse::<f64>(),
    )(input)
}

/// `5m`, `1h30m`, `10s`, `2d`, `1w`, `1y`, `500ms` -> milliseconds.
fn duration_ms(input: &str) -> IResult<&str, i64> {
    map(
        separated_list1(
            multispace0,
            pair(
                map_res(digit1, |s: &str| s.parse::<i64>()),
                alt((
                    tag("ms"),
                    tag("y"),
                    tag("w"),
                    tag("d"),
                    tag("h"),
                    tag("m"),
                    tag("s"),
                )),
            ),
        ),
        |parts| {
            parts
                .into_iter()
                .map(|(n, unit)| n * unit_ms(unit))
                .sum()
        },
    )(input)
}

fn unit_ms(unit: &str) -> i64 {
    match unit {
        "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        "w" => 7 * 86_400_000,
        "y" => 365 * 86_400_000,
        _ => unreachable!(),
    }
}

fn match_op(input: &str) -> IResult<&str, MatchOp> {
    alt((
        value(MatchOp::Re, tag("=~")),
        value(MatchOp::Nre, tag("!~")),
        value(MatchOp::Ne, tag("!=")),
        value(MatchOp::Eq, tag("=")),
    ))(input)
}

fn label_matcher(input: &str) -> IResult<&str, LabelMatcher> {
    map(
        tuple((ws(identifier), ws(match_op), ws(quoted_string))),
        |(label, op, value)| LabelMatcher {
            label: label.to_string(),
            op,
            value,
        },
    )(input)
}

fn label_matchers(input: &str) -> IResult<&str, Vec<LabelMatcher>> {
    delimited(
        char('{'),
        separated_list0(ws(char(',')), label_matcher),
        preceded(opt(ws(char(','))), char('}')),
    )(input)
}

fn vector_selector(input: &str) -> IResult<&str, VectorSelector> {
    alt((
        map(
            tuple((identifier, opt(label_matchers))),
            |(metric, matchers)| VectorSelector {
                metric: Some(metric.to_string()),
                matchers: matchers.unwrap_or_default(),
                offset_ms: None,
            },
        ),
        map(label_matchers, |matchers| VectorSelector {
            metric: None,
            matchers,
            offset_ms: None,
        }),
    ))(input)
}

fn offset_suffix(input: &str) -> IResult<&str, i64> {
    preceded(
        tuple((multispace0, tag_no_case("offset"), multispace0)),
        duration_ms,
    )(input)
}

fn grouping(input: &str) -> IResult<&str, Grouping> {
    map(
        opt(tuple((
            ws(alt((
                value(GroupMod::By, tag_no_case("by")),
                value(GroupMod::Without, tag_no_case("without")),
            ))),
            delimited(
                char('('),
                separated_list0(ws(char(',')), ws(identifier)),
                char(')'),
            ),
        ))),
        |g| match g {
            Some((modifier, labels)) => Grouping {
                modifier: Some(modifier),
                labels: labels.into_iter().map(str::to_string).collect(),
            },
            None => Grouping::default(),
        },
    )(input)
}

fn aggregate_expr(input: &str) -> IResult<&str, LogicalPlan> {
    let (rest, name) = identifier(input)?;
    if !AGGREGATE_NAMES.contains(name) {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Tag,
        )));
    }
    let op = aggregate_op(name);
    // Grouping may appear before or after the argument list.
    let (rest, leading_group) = ws(grouping)(rest)?;
    let (rest, args) = delimited(
        char('('),
        separated_list1(ws(char(',')), expr),
        char(')'),
    )(rest)?;
    let (rest, trailing_group) = ws(grouping)(rest)?;
    let grouping = if leading_group.modifier.is_some() {
        leading_group
    } else {
        trailing_group
    };

    let (param, body) = if op.takes_param() {
        let mut it = args.into_iter();
        let param = it.next();
        let body = it.next();
        (param, body)
    } else {
        let mut it = args.into_iter();
        (None, it.next())
    };
    let body = match body {
        Some(b) => b,
        None => {
            return Err(nom::Err::Error(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Tag,
            )))
        }
    };
    Ok((
        rest,
        LogicalPlan::Aggregate {
            op,
            expr: Box::new(body),
            param: param.map(Box::new),
            grouping,
        },
    ))
}

fn aggregate_op(name: &str) -> AggregateOp {
    match name {
        "sum" => AggregateOp::Sum,
        "avg" => AggregateOp::Avg,
        "count" => AggregateOp::Count,
        "group" => AggregateOp::Group,
        "min" => AggregateOp::Min,
        "max" => AggregateOp::Max,
        "stddev" => AggregateOp::Stddev,
        "stdvar" => AggregateOp::Stdvar,
        "topk" => AggregateOp::Topk,
        "bottomk" => AggregateOp::Bottomk,
        "count_values" => AggregateOp::CountValues,
        "quantile" => AggregateOp::Quantile,
        _ => unreachable!(),
    }
}

fn call_expr(input: &str) -> IResult<&str, LogicalPlan> {
    map(
        tuple((
            identifier,
            delimited(
                char('('),
                separated_list0(ws(char(',')), expr),
                char(')'),
            ),
        )),
        |(func, args)| LogicalPlan::Call {
            func: func.to_string(),
            args,
        },
    )(input)
}

/// A selector possibly followed by `[range]` and/or `offset`.
fn selector_or_range(input: &str) -> IResult<&str, LogicalPlan> {
    let (rest, selector) = vector_selector(input)?;
    let (rest, range) = opt(delimited(char('['), duration_ms, char(']')))(rest)?;
    let (rest, offset) = opt(offset_suffix)(rest)?;
    let plan = match range {
        Some(range_ms) => LogicalPlan::RangeSelector {
            selector: VectorSelector {
                offset_ms: offset,
                ..selector
            },
            range_ms,
        },
        None => LogicalPlan::VectorSelector(VectorSelector {
            offset_ms: offset,
            ..selector
        }),
    };
    Ok((rest, plan))
}

/// `expr[window:step]` subquery suffix, applied after any primary.
fn subquery_suffix(input: &str, base: LogicalPlan) -> IResult<&str, LogicalPlan> {
    let (rest, sub) = opt(tuple((
        delimited(
            char('['),
            tuple((duration_ms, preceded(char(':'), opt(duration_ms)))),
            char(']'),
        ),
        opt(offset_suffix),
    )))(input)?;
    Ok(match sub {
        Some(((range_ms, step_ms), offset_ms)) => (
            rest,
            LogicalPlan::Subquery {
                expr: Box::new(base),
                range_ms,
                step_ms,
                offset_ms,
            },
        ),
        None => (input, base),
    })
}

fn parenthesized(input: &str) -> IResult<&str, LogicalPlan> {
    delimited(char('('), ws(expr), char(')'))(input)
}

fn unary(input: &str) -> IResult<&str, LogicalPlan> {
    map(
        pair(opt(alt((char('+'), char('-')))), ws(primary)),
        |(sign, expr)| match sign {
            Some('-') => LogicalPlan::Unary {
                negative: true,
                expr: Box::new(expr),
            },
            _ => expr,
        },
    )(input)
}

fn primary(input: &str) -> IResult<&str, LogicalPlan> {
    let (rest, base) = alt((
        map(number_literal, LogicalPlan::NumberLiteral),
        map(quoted_string, LogicalPlan::StringLiteral),
        aggregate_expr,
        call_expr,
        parenthesized,
        selector_or_range,
    ))(input)?;
    subquery_suffix(rest, base)
}

fn vector_matching(input: &str) -> IResult<&str, VectorMatching> {
    map(
        tuple((
            opt(tuple((
                ws(alt((
                    value(true, tag_no_case("on")),
                    value(false, tag_no_case("ignoring")),
                ))),
                delimited(
                    char('('),
                    separated_list0(ws(char(',')), ws(identifier)),
                    char(')'),
                ),
            ))),
            opt(ws(tuple((
                alt((
                    value(VectorCardinality::ManyToOne, tag_no_case("group_left")),
                    value(VectorCardinality::OneToMany, tag_no_case("group_right")),
                )),
                opt(delimited(
                    char('('),
                    separated_list0(ws(char(',')), ws(identifier)),
                    char(')'),
                )),
            ))),
        )),
        |(on_ignoring, group)| {
            let (on, labels) = match on_ignoring {
                Some((on, labels)) => (on, labels.into_iter().map(str::to_string).collect()),
                None => (false, Vec::new()),
            };
            let (cardinality, include) = match group {
                Some((card, include)) => (
                    Some(card),
                    include
                        .unwrap_or_default()
                        .into_iter()
                        .map(str::to_string)
                        .collect(),
                ),
                None => (None, Vec::new()),
            };
            VectorMatching {
                on,
                labels,
                cardinality,
                include,
            }
        },
    )(input)
}

fn binary_op(input: &str) -> IResult<&str, BinaryOp> {
    alt((
        value(BinaryOp::Eq, tag("==")),
        value(BinaryOp::Ne, tag("!=")),
        value(BinaryOp::Ge, tag(">=")),
        value(BinaryOp::Le, tag("<=")),
        value(BinaryOp::Gt, tag(">")),
        value(BinaryOp::Lt, tag("<")),
        value(BinaryOp::Add, tag("+")),
        value(BinaryOp::Sub, tag("-")),
        value(BinaryOp::Mul, tag("*")),
        value(BinaryOp::Div, tag("/")),
        value(BinaryOp::Mod, tag("%")),
        value(BinaryOp::Pow, tag("^")),
        value(BinaryOp::And, tag_no_case("and")),
        value(BinaryOp::Or, tag_no_case("or")),
        value(BinaryOp::Unless, tag_no_case("unless")),
    ))(input)
}

/// Precedence-climbing binary expression parser.
fn binary_expr(input: &str, min_prec: u8) -> IResult<&str, LogicalPlan> {
    let (mut rest, mut lhs) = ws(unary)(input)?;
    loop {
        let attempt = ws(binary_op)(rest);
        let (next_rest, op) = match attempt {
            Ok(v) => v,
            Err(_) => break,
        };
        if op.precedence() < min_prec {
            break;
        }
        let (next_rest, matching) = ws(opt(vector_matching))(next_rest)?;
        let next_min = if op.right_associative() {
            op.precedence()
        } else {
            op.precedence() + 1
        };
        let (next_rest, rhs) = binary_expr(next_rest, next_min)?;
        lhs = LogicalPlan::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
            matching: matching.unwrap_or_default(),
        };
        rest = next_rest;
    }
    Ok((rest, lhs))
}

fn expr(input: &str) -> IResult<&str, LogicalPlan> {
    binary_expr(input, 1)
}
