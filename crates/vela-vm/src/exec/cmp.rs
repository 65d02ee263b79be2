//! Condition evaluation for the `If` instruction family.

use vela_runtime::instruction::Condition;

pub(crate) fn int_condition(x: i64, y: i64, cond: Condition) -> bool {
    match cond {
        Condition::Equal => x == y,
        Condition::NotEqual => x != y,
        Condition::Less => x < y,
        Condition::LessOrEqual => x <= y,
        Condition::Greater => x > y,
        Condition::GreaterOrEqual => x >= y,
        _ => panic!("bad int condition {:?}", cond),
    }
}

pub(crate) fn uint_condition(x: u64, y: u64, cond: Condition) -> bool {
    match cond {
        Condition::Equal => x == y,
        Condition::NotEqual => x != y,
        Condition::Less => x < y,
        Condition::LessOrEqual => x <= y,
        Condition::Greater => x > y,
        Condition::GreaterOrEqual => x >= y,
        _ => panic!("bad uint condition {:?}", cond),
    }
}

pub(crate) fn float_condition(x: f64, y: f64, cond: Condition) -> bool {
    match cond {
        Condition::Equal => x == y,
        Condition::NotEqual => x != y,
        Condition::Less => x < y,
        Condition::LessOrEqual => x <= y,
        Condition::Greater => x > y,
        Condition::GreaterOrEqual => x >= y,
        _ => panic!("bad float condition {:?}", cond),
    }
}

pub(crate) fn string_condition(x: &str, y: &str, cond: Condition) -> bool {
    match cond {
        Condition::Equal => x == y,
        Condition::NotEqual => x != y,
        Condition::Less => x < y,
        Condition::LessOrEqual => x <= y,
        Condition::Greater => x > y,
        Condition::GreaterOrEqual => x >= y,
        _ => panic!("bad string condition {:?}", cond),
    }
}

pub(crate) fn len_condition(len: i64, y: i64, cond: Condition) -> bool {
    match cond {
        Condition::EqualLen => len == y,
        Condition::NotEqualLen => len != y,
        Condition::LessLen => len < y,
        Condition::LessOrEqualLen => len <= y,
        Condition::GreaterLen => len > y,
        Condition::GreaterOrEqualLen => len >= y,
        _ => panic!("bad len condition {:?}", cond),
    }
}
