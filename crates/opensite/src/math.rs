//! Per-branch arithmetic resolution.
//!
//! Site descriptions may express values like buffer distances as arithmetic
//! over the branch parameters (`height-to-tip * 1.5`). Any string property
//! that evaluates cleanly against the branch context is replaced by the
//! resulting number; anything else is left untouched.

use std::collections::BTreeMap;

use evalexpr::{ContextWithMutableVariables, HashMapContext, Value};

/// The numeric context for one branch: parameter name -> value. Keys keep
/// their YAML spelling (`height-to-tip`).
pub type MathContext = BTreeMap<String, f64>;

/// Identifier as the expression engine sees it: hyphens are not legal in
/// variable names, so `height-to-tip` evaluates as `height_to_tip`.
fn eval_name(key: &str) -> String {
    key.replace('-', "_")
}

/// Try to evaluate `raw` as arithmetic over `ctx`.
///
/// Returns `None` when the string is not an expression (unknown words,
/// URLs, plain prose), in which case callers keep the original value.
pub fn resolve_math(raw: &str, ctx: &MathContext) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut expression = trimmed.to_string();
    for key in ctx.keys() {
        if key.contains('-') {
            expression = expression.replace(key.as_str(), &eval_name(key));
        }
    }

    let mut context = HashMapContext::new();
    for (key, value) in ctx {
        context.set_value(eval_name(key), Value::Float(*value)).ok()?;
    }

    evalexpr::eval_number_with_context(&expression, &context)
        .ok()
        .filter(|n| n.is_finite())
}
