//! Dynamic interface satisfaction for type assertions.

use vela_runtime::types::{Type, TypeHandle};
use vela_runtime::value::Value;

pub(crate) fn value_implements(v: &Value, iface: &TypeHandle) -> bool {
    let underlying = Type::underlying(iface);
    let methods = match &*underlying {
        Type::Interface(ms) => ms,
        _ => return false,
    };
    if methods.is_empty() {
        return true;
    }
    match v {
        Value::Struct(s) => Type::implements(&s.typ, iface),
        _ => false,
    }
}
