use crate::ir::Value;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum UnOp {
    Not,
    Neg,
    Abs,
    Sqrt,
    Rcp,
    Floor,
    Length,
    Normalize,
    ToF32,
    ToU32,
    ToU64,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Min,
    Max,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Dot,
    Cross,
}

/// Evaluates a unary operation, `None` if the operand type is not supported.
pub fn unary(op: UnOp, a: Value) -> Option<Value> {
    use Value::*;
    Some(match (op, a) {
        (UnOp::Not, Bool(a)) => Bool(!a),
        (UnOp::Not, U32(a)) => U32(!a),
        (UnOp::Neg, F32(a)) => F32(-a),
        (UnOp::Neg, U32(a)) => U32(a.wrapping_neg()),
        (UnOp::Neg, Vec2(a)) => Vec2(-a),
        (UnOp::Neg, Vec3(a)) => Vec3(-a),
        (UnOp::Abs, F32(a)) => F32(a.abs()),
        (UnOp::Abs, Vec3(a)) => Vec3(a.abs()),
        (UnOp::Sqrt, F32(a)) => F32(a.sqrt()),
        (UnOp::Rcp, F32(a)) => F32(a.recip()),
        (UnOp::Rcp, Vec3(a)) => Vec3(a.recip()),
        (UnOp::Floor, F32(a)) => F32(a.floor()),
        (UnOp::Floor, Vec3(a)) => Vec3(a.floor()),
        (UnOp::Length, Vec2(a)) => F32(a.length()),
        (UnOp::Length, Vec3(a)) => F32(a.length()),
        (UnOp::Normalize, Vec2(a)) => Vec2(a.normalize_or_zero()),
        (UnOp::Normalize, Vec3(a)) => Vec3(a.normalize_or_zero()),
        (UnOp::ToF32, U32(a)) => F32(a as f32),
        (UnOp::ToF32, F32(a)) => F32(a),
        (UnOp::ToF32, Bool(a)) => F32(a as u32 as f32),
        (UnOp::ToU32, F32(a)) => U32(a as u32),
        (UnOp::ToU32, U32(a)) => U32(a),
        (UnOp::ToU32, U64(a)) => U32(a as u32),
        (UnOp::ToU32, Bool(a)) => U32(a as u32),
        (UnOp::ToU64, U32(a)) => U64(a as u64),
        (UnOp::ToU64, U64(a)) => U64(a),
        _ => return None,
    })
}

/// Evaluates a binary operation, `None` if the operand types are not
/// supported. Integer arithmetic wraps.
pub fn binary(op: BinOp, a: Value, b: Value) -> Option<Value> {
    use Value::*;
    Some(match (op, a, b) {
        (BinOp::Add, U32(a), U32(b)) => U32(a.wrapping_add(b)),
        (BinOp::Add, U64(a), U64(b)) => U64(a.wrapping_add(b)),
        (BinOp::Add, U64(a), U32(b)) => U64(a.wrapping_add(b as u64)),
        (BinOp::Add, F32(a), F32(b)) => F32(a + b),
        (BinOp::Add, Vec2(a), Vec2(b)) => Vec2(a + b),
        (BinOp::Add, Vec3(a), Vec3(b)) => Vec3(a + b),
        (BinOp::Sub, U32(a), U32(b)) => U32(a.wrapping_sub(b)),
        (BinOp::Sub, U64(a), U64(b)) => U64(a.wrapping_sub(b)),
        (BinOp::Sub, F32(a), F32(b)) => F32(a - b),
        (BinOp::Sub, Vec2(a), Vec2(b)) => Vec2(a - b),
        (BinOp::Sub, Vec3(a), Vec3(b)) => Vec3(a - b),
        (BinOp::Mul, U32(a), U32(b)) => U32(a.wrapping_mul(b)),
        (BinOp::Mul, U64(a), U64(b)) => U64(a.wrapping_mul(b)),
        (BinOp::Mul, F32(a), F32(b)) => F32(a * b),
        (BinOp::Mul, Vec2(a), Vec2(b)) => Vec2(a * b),
        (BinOp::Mul, Vec3(a), Vec3(b)) => Vec3(a * b),
        (BinOp::Mul, Vec2(a), F32(b)) => Vec2(a * b),
        (BinOp::Mul, Vec3(a), F32(b)) => Vec3(a * b),
        (BinOp::Div, U32(a), U32(b)) => U32(a.checked_div(b).unwrap_or(u32::MAX)),
        (BinOp::Div, F32(a), F32(b)) => F32(a / b),
        (BinOp::Div, Vec3(a), F32(b)) => Vec3(a / b),
        (BinOp::Rem, U32(a), U32(b)) => U32(a.checked_rem(b).unwrap_or(0)),
        (BinOp::Rem, F32(a), F32(b)) => F32(a % b),
        (BinOp::Min, U32(a), U32(b)) => U32(a.min(b)),
        (BinOp::Min, F32(a), F32(b)) => F32(a.min(b)),
        (BinOp::Min, Vec3(a), Vec3(b)) => Vec3(a.min(b)),
        (BinOp::Max, U32(a), U32(b)) => U32(a.max(b)),
        (BinOp::Max, F32(a), F32(b)) => F32(a.max(b)),
        (BinOp::Max, Vec3(a), Vec3(b)) => Vec3(a.max(b)),
        (BinOp::And, Bool(a), Bool(b)) => Bool(a && b),
        (BinOp::And, U32(a), U32(b)) => U32(a & b),
        (BinOp::Or, Bool(a), Bool(b)) => Bool(a || b),
        (BinOp::Or, U32(a), U32(b)) => U32(a | b),
        (BinOp::Xor, Bool(a), Bool(b)) => Bool(a ^ b),
        (BinOp::Xor, U32(a), U32(b)) => U32(a ^ b),
        (BinOp::Shl, U32(a), U32(b)) => U32(a.wrapping_shl(b)),
        (BinOp::Shr, U32(a), U32(b)) => U32(a.wrapping_shr(b)),
        (BinOp::Shl, U64(a), U32(b)) => U64(a.wrapping_shl(b)),
        (BinOp::Shr, U64(a), U32(b)) => U64(a.wrapping_shr(b)),
        (BinOp::Eq, a, b) if a.ty() == b.ty() => Bool(a == b),
        (BinOp::Ne, a, b) if a.ty() == b.ty() => Bool(a != b),
        (BinOp::Lt, U32(a), U32(b)) => Bool(a < b),
        (BinOp::Lt, F32(a), F32(b)) => Bool(a < b),
        (BinOp::Le, U32(a), U32(b)) => Bool(a <= b),
        (BinOp::Le, F32(a), F32(b)) => Bool(a <= b),
        (BinOp::Gt, U32(a), U32(b)) => Bool(a > b),
        (BinOp::Gt, F32(a), F32(b)) => Bool(a > b),
        (BinOp::Ge, U32(a), U32(b)) => Bool(a >= b),
        (BinOp::Ge, F32(a), F32(b)) => Bool(a >= b),
        (BinOp::Dot, Vec2(a), Vec2(b)) => F32(a.dot(b)),
        (BinOp::Dot, Vec3(a), Vec3(b)) => F32(a.dot(b)),
        (BinOp::Cross, Vec3(a), Vec3(b)) => Vec3(a.cross(b)),
        _ => return None,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wrapping_offsets() {
        let sp = Value::U32(16);
        let arg = binary(BinOp::Sub, Value::U32(0), Value::U32(48)).unwrap();
        assert_eq!(binary(BinOp::Add, sp, arg), Some(Value::U32(16u32.wrapping_sub(48))));
        assert_eq!(
            binary(BinOp::Add, binary(BinOp::Add, sp, arg).unwrap(), Value::U32(48)),
            Some(Value::U32(16))
        );
    }

    #[test]
    fn mismatched_operands() {
        assert_eq!(binary(BinOp::Add, Value::U32(1), Value::F32(1.)), None);
        assert_eq!(binary(BinOp::Eq, Value::U32(1), Value::Bool(true)), None);
        assert_eq!(unary(UnOp::Sqrt, Value::U32(4)), None);
    }
}
