use crate::parser::ast::{Comparison, Condition, Operand};
use crate::parser::token::CmpOp;
use crate::vars::VarContext;

/// Evaluate a conditional test against the variable map.
///
/// `AND` binds tighter than `OR`; groups evaluate left to right. Unknown
/// variables resolve to the empty string. Operands that both parse as
/// numbers compare numerically, otherwise as strings.
pub fn evaluate(condition: &Condition, vars: &VarContext) -> bool {
    condition
        .any_of
        .iter()
        .any(|group| group.iter().all(|cmp| evaluate_comparison(cmp, vars)))
}

fn evaluate_comparison(cmp: &Comparison, vars: &VarContext) -> bool {
    let left = operand_value(&cmp.left, vars);
    let right = operand_value(&cmp.right, vars);

    if let (Ok(l), Ok(r)) = (left.parse::<f64>(), right.parse::<f64>()) {
        return compare(cmp.op, &l, &r);
    }
    compare(cmp.op, left.as_str(), right.as_str())
}

fn compare<T: PartialOrd + PartialEq + ?Sized>(op: CmpOp, left: &T, right: &T) -> bool {
    match op {
        CmpOp::Eq => left == right,
        CmpOp::Ne => left != right,
        CmpOp::Gt => left > right,
        CmpOp::Ge => left >= right,
        CmpOp::Lt => left < right,
        CmpOp::Le => left <= right,
    }
}

fn operand_value(operand: &Operand, vars: &VarContext) -> String {
    match operand {
        Operand::Ident(name) => vars.resolve(name).map(|(v, _)| v).unwrap_or_default(),
        Operand::Str(s) => s.clone(),
        Operand::Number(n) => n.clone(),
        Operand::VarRef { name, default } => vars
            .resolve_or_default(name, default.as_deref())
            .map(|(v, _)| v)
            .unwrap_or_default(),
    }
}
