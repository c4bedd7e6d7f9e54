//! Condition evaluation against run context

use serde_json::{json, Value};

use super::ast::{CompareOp, Condition, Connective};
use crate::runbook::workflow::template::{resolve, RunContext};

/// Evaluate an ordered condition list, combining results strictly
/// left-to-right with each condition's declared connective. Returns the
/// final boolean plus a per-condition trace suitable for storing as the
/// branch step's structured output.
pub fn evaluate_all(
    conditions: &[Condition],
    ctx: &RunContext,
    warnings: &mut Vec<String>,
) -> (bool, Value) {
    let mut trace = Vec::with_capacity(conditions.len());
    let mut acc = false;
    for (i, cond) in conditions.iter().enumerate() {
        let (matched, left, right) = evaluate_one(cond, ctx, warnings);
        trace.push(json!({
            "source": cond.source,
            "left": left,
            "op": cond.op.to_string(),
            "right": right,
            "matched": matched,
        }));
        if i == 0 {
            acc = matched;
        } else {
            acc = match conditions[i - 1].connective {
                Connective::And => acc && matched,
                Connective::Or => acc || matched,
            };
        }
    }
    (acc, Value::Array(trace))
}

fn evaluate_one(
    cond: &Condition,
    ctx: &RunContext,
    warnings: &mut Vec<String>,
) -> (bool, String, String) {
    let left = resolve(&cond.source, ctx, warnings);
    let right = resolve(&cond.value, ctx, warnings);
    (compare(cond.op, &left, &right), left, right)
}

/// Compare two resolved (stringified) values. Ordering operators require
/// both sides to parse as numbers; equality falls back to numeric
/// comparison when both sides parse, so `"101" == "101.0"` holds.
fn compare(op: CompareOp, left: &str, right: &str) -> bool {
    let nums = match (left.parse::<f64>(), right.parse::<f64>()) {
        (Ok(l), Ok(r)) => Some((l, r)),
        _ => None,
    };
    match op {
        CompareOp::Eq => match nums {
            Some((l, r)) => (l - r).abs() < f64::EPSILON,
            None => left == right,
        },
        CompareOp::NotEq => !compare(CompareOp::Eq, left, right),
        CompareOp::Gt => nums.map(|(l, r)| l > r).unwrap_or(false),
        CompareOp::Gte => nums.map(|(l, r)| l >= r).unwrap_or(false),
        CompareOp::Lt => nums.map(|(l, r)| l < r).unwrap_or(false),
        CompareOp::Lte => nums.map(|(l, r)| l <= r).unwrap_or(false),
        CompareOp::Contains => left.contains(right),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> RunContext {
        let mut ctx = RunContext::default();
        ctx.chain.insert("pool".to_string(), json!("web-pool"));
        ctx.record_step(
            "s1",
            json!({"output": {"members_up": 3, "state": "available"}, "status": "complete"}),
        );
        ctx
    }

    #[test]
    fn test_string_equality() {
        let conds = vec![Condition::new(
            "{{steps.s1.output.state}}",
            CompareOp::Eq,
            "available",
        )];
        let mut w = Vec::new();
        let (result, _) = evaluate_all(&conds, &ctx(), &mut w);
        assert!(result);
    }

    #[test]
    fn test_numeric_comparison() {
        let mut w = Vec::new();
        let conds = vec![Condition::new(
            "{{steps.s1.output.members_up}}",
            CompareOp::Gte,
            "2",
        )];
        assert!(evaluate_all(&conds, &ctx(), &mut w).0);

        let conds = vec![Condition::new(
            "{{steps.s1.output.members_up}}",
            CompareOp::Lt,
            "2",
        )];
        assert!(!evaluate_all(&conds, &ctx(), &mut w).0);
    }

    #[test]
    fn test_contains() {
        let mut w = Vec::new();
        let conds = vec![Condition::new("{{chain.pool}}", CompareOp::Contains, "web")];
        assert!(evaluate_all(&conds, &ctx(), &mut w).0);
    }

    #[test]
    fn test_and_connective() {
        let mut w = Vec::new();
        let conds = vec![
            Condition::new("{{steps.s1.output.state}}", CompareOp::Eq, "available"),
            Condition::new("{{steps.s1.output.members_up}}", CompareOp::Gt, "5"),
        ];
        assert!(!evaluate_all(&conds, &ctx(), &mut w).0);
    }

    #[test]
    fn test_or_connective() {
        let mut w = Vec::new();
        let conds = vec![
            Condition::new("{{steps.s1.output.state}}", CompareOp::Eq, "offline").or_next(),
            Condition::new("{{steps.s1.output.members_up}}", CompareOp::Gt, "2"),
        ];
        assert!(evaluate_all(&conds, &ctx(), &mut w).0);
    }

    #[test]
    fn test_left_to_right_no_precedence() {
        // false AND true OR true evaluates as ((false && true) || true)
        let mut w = Vec::new();
        let conds = vec![
            Condition::new("a", CompareOp::Eq, "b"),
            Condition::new("x", CompareOp::Eq, "x").or_next(),
            Condition::new("y", CompareOp::Eq, "y"),
        ];
        // cond1=false, AND cond2=true -> false, OR cond3=true -> true
        assert!(evaluate_all(&conds, &ctx(), &mut w).0);
    }

    #[test]
    fn test_missing_reference_compares_empty() {
        let mut w = Vec::new();
        let conds = vec![Condition::new("{{steps.nope.output.x}}", CompareOp::Eq, "")];
        assert!(evaluate_all(&conds, &ctx(), &mut w).0);
        assert!(!w.is_empty());
    }

    #[test]
    fn test_trace_records_each_condition() {
        let mut w = Vec::new();
        let conds = vec![
            Condition::new("{{steps.s1.output.members_up}}", CompareOp::Gte, "2"),
            Condition::new("{{steps.s1.output.state}}", CompareOp::Eq, "available"),
        ];
        let (_, trace) = evaluate_all(&conds, &ctx(), &mut w);
        let arr = trace.as_array().unwrap();
        assert_eq!(arr.len(), 2);
        assert_eq!(arr[0]["left"], "3");
        assert_eq!(arr[0]["matched"], true);
    }

    #[test]
    fn test_empty_condition_list_is_false() {
        let mut w = Vec::new();
        assert!(!evaluate_all(&[], &ctx(), &mut w).0);
    }
}
