use serde_json::Value;

use crate::crdt::element::ElementMeta;
use crate::ids::TimeTicket;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Counter payload. Both widths wrap on overflow so every replica lands on the same value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CounterValue {
    Int(i32),
    Long(i64),
}

impl CounterValue {
    pub fn as_i64(&self) -> i64 {
        match self {
            CounterValue::Int(v) => i64::from(*v),
            CounterValue::Long(v) => *v,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CrdtCounter {
    pub(crate) meta: ElementMeta,
    value: CounterValue,
}

impl CrdtCounter {
    pub fn new(value: CounterValue, created_at: TimeTicket) -> Self {
        Self {
            meta: ElementMeta::new(created_at),
            value,
        }
    }

    pub fn value(&self) -> CounterValue {
        self.value
    }

    pub fn increase(&mut self, delta: i64) {
        self.value = match self.value {
            CounterValue::Int(v) => CounterValue::Int(v.wrapping_add(delta as i32)),
            CounterValue::Long(v) => CounterValue::Long(v.wrapping_add(delta)),
        };
    }

    pub fn to_json_value(&self) -> Value {
        Value::from(self.value.as_i64())
    }
}
