//! Value marshalling across the embedding boundary.
//!
//! `CValue` is a self-contained tree: no heap ids, safe to hold on the host
//! side for any lifetime. Marshalling in allocates containers on the VM heap;
//! marshalling out deep-copies. Round-trip law: `to_c(from_c(v)) == v` for
//! primitives and for arrays/options/results of primitives.

use super::heap::{Heap, HeapData};
use super::value::Value;

/// A host-side value.
#[derive(Debug, Clone, PartialEq)]
pub enum CValue {
    Nil,
    Bool(bool),
    Char(char),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<CValue>),
    Tuple(Vec<CValue>),
    Some(Box<CValue>),
    None,
    Ok(Box<CValue>),
    Err(Box<CValue>),
}

impl CValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            CValue::Nil => "nil",
            CValue::Bool(_) => "bool",
            CValue::Char(_) => "char",
            CValue::Int(_) => "int",
            CValue::Float(_) => "float",
            CValue::Str(_) => "string",
            CValue::Array(_) => "array",
            CValue::Tuple(_) => "tuple",
            CValue::Some(_) | CValue::None => "option",
            CValue::Ok(_) | CValue::Err(_) => "result",
        }
    }
}

/// Marshal a host value into the VM. Containers are allocated on the heap;
/// the returned value is an owned handle.
pub fn from_c(heap: &mut Heap, cv: &CValue) -> Value {
    match cv {
        CValue::Nil => Value::Nil,
        CValue::Bool(b) => Value::Bool(*b),
        CValue::Char(c) => Value::Char(*c),
        CValue::Int(i) => Value::Int(*i),
        CValue::Float(f) => Value::Float(*f),
        CValue::Str(s) => Value::str(s),
        CValue::Array(items) => {
            let values: Vec<Value> = items.iter().map(|i| from_c(heap, i)).collect();
            let id = heap.alloc(HeapData::Array(values.clone()));
            // `alloc` retained the children; the build loop's handles were
            // transient owners, so drop them.
            for v in &values {
                heap.release(v);
            }
            Value::Array(id)
        }
        CValue::Tuple(items) => {
            let values: Vec<Value> = items.iter().map(|i| from_c(heap, i)).collect();
            let id = heap.alloc(HeapData::Tuple(values.clone()));
            for v in &values {
                heap.release(v);
            }
            Value::Tuple(id)
        }
        CValue::Some(inner) => Value::Some(Box::new(from_c(heap, inner))),
        CValue::None => Value::NoneVal,
        CValue::Ok(inner) => Value::Ok(Box::new(from_c(heap, inner))),
        CValue::Err(inner) => Value::Err(Box::new(from_c(heap, inner))),
    }
}

/// Marshal a VM value out to the host as a deep copy. Refs and weak refs
/// marshal their target's current value; dead weak targets marshal to nil.
pub fn to_c(heap: &Heap, v: &Value) -> CValue {
    match v {
        Value::Nil => CValue::Nil,
        Value::Bool(b) => CValue::Bool(*b),
        Value::Char(c) => CValue::Char(*c),
        Value::Int(i) => CValue::Int(*i),
        Value::Float(f) => CValue::Float(*f),
        Value::Str(s) => CValue::Str(s.to_string()),
        Value::Some(inner) => CValue::Some(Box::new(to_c(heap, inner))),
        Value::NoneVal => CValue::None,
        Value::Ok(inner) => CValue::Ok(Box::new(to_c(heap, inner))),
        Value::Err(inner) => CValue::Err(Box::new(to_c(heap, inner))),
        Value::Array(id) => match heap.get(*id).filter(|c| c.alive).map(|c| &c.data) {
            Some(HeapData::Array(items)) => {
                CValue::Array(items.iter().map(|i| to_c(heap, i)).collect())
            }
            _ => CValue::Nil,
        },
        Value::Tuple(id) => match heap.get(*id).filter(|c| c.alive).map(|c| &c.data) {
            Some(HeapData::Tuple(items)) => {
                CValue::Tuple(items.iter().map(|i| to_c(heap, i)).collect())
            }
            _ => CValue::Nil,
        },
        Value::Ref(id) | Value::Weak(id) => {
            match heap.get(*id).filter(|c| c.alive).map(|c| &c.data) {
                Some(HeapData::Cell(inner)) => to_c(heap, inner),
                _ => CValue::Nil,
            }
        }
        Value::Enum { int_val, .. } => CValue::Int(*int_val),
        // Opaque runtime handles have no host representation.
        _ => CValue::Nil,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_round_trip() {
        let mut heap = Heap::new();
        for cv in [
            CValue::Nil,
            CValue::Bool(true),
            CValue::Char('e'),
            CValue::Int(-7),
            CValue::Float(2.5),
            CValue::Str("etch".to_string()),
        ] {
            let v = from_c(&mut heap, &cv);
            assert_eq!(to_c(&heap, &v), cv);
            heap.release(&v);
        }
        assert_eq!(heap.live_cells(), 0);
    }

    #[test]
    fn test_array_of_primitives_round_trip() {
        let mut heap = Heap::new();
        let cv = CValue::Array(vec![CValue::Int(1), CValue::Int(2), CValue::Int(3)]);
        let v = from_c(&mut heap, &cv);
        assert_eq!(to_c(&heap, &v), cv);
        heap.release(&v);
        assert_eq!(heap.live_cells(), 0);
    }

    #[test]
    fn test_option_result_round_trip() {
        let mut heap = Heap::new();
        let cases = [
            CValue::Some(Box::new(CValue::Int(5))),
            CValue::None,
            CValue::Ok(Box::new(CValue::Str("fine".into()))),
            CValue::Err(Box::new(CValue::Str("boom".into()))),
        ];
        for cv in cases {
            let v = from_c(&mut heap, &cv);
            assert_eq!(to_c(&heap, &v), cv);
            heap.release(&v);
        }
        assert_eq!(heap.live_cells(), 0);
    }

    #[test]
    fn test_nested_array_round_trip() {
        let mut heap = Heap::new();
        let cv = CValue::Array(vec![
            CValue::Array(vec![CValue::Int(1)]),
            CValue::Some(Box::new(CValue::Float(0.5))),
        ]);
        let v = from_c(&mut heap, &cv);
        assert_eq!(to_c(&heap, &v), cv);
        heap.release(&v);
        assert_eq!(heap.live_cells(), 0);
    }
}
