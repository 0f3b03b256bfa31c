use itertools::Itertools;
use std::fmt;

bitflags::bitflags! {
  /// Classification of a script value, computed once when the value is wrapped.
  ///
  /// A value usually carries several bits at once (an array is also an object, an `Int32` is also
  /// a number), so tests are done against a single kind or an aggregate mask with
  /// [`Value::is_kind`](crate::Value::is_kind).
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
  pub struct Kind: u64 {
    const UNDEFINED = 1 << 0;
    const NULL = 1 << 1;
    const NAME = 1 << 2;
    const STRING = 1 << 3;
    const SYMBOL = 1 << 4;
    const FUNCTION = 1 << 5;
    const ARRAY = 1 << 6;
    const OBJECT = 1 << 7;
    const BOOLEAN = 1 << 8;
    const NUMBER = 1 << 9;
    const EXTERNAL = 1 << 10;
    const INT32 = 1 << 11;
    const UINT32 = 1 << 12;
    const DATE = 1 << 13;
    const ARGUMENTS_OBJECT = 1 << 14;
    const BOOLEAN_OBJECT = 1 << 15;
    const NUMBER_OBJECT = 1 << 16;
    const STRING_OBJECT = 1 << 17;
    const SYMBOL_OBJECT = 1 << 18;
    const NATIVE_ERROR = 1 << 19;
    const REG_EXP = 1 << 20;
    const ASYNC_FUNCTION = 1 << 21;
    const GENERATOR_FUNCTION = 1 << 22;
    const GENERATOR_OBJECT = 1 << 23;
    const PROMISE = 1 << 24;
    const MAP = 1 << 25;
    const SET = 1 << 26;
    const MAP_ITERATOR = 1 << 27;
    const SET_ITERATOR = 1 << 28;
    const WEAK_MAP = 1 << 29;
    const WEAK_SET = 1 << 30;
    const ARRAY_BUFFER = 1 << 31;
    const ARRAY_BUFFER_VIEW = 1 << 32;
    const TYPED_ARRAY = 1 << 33;
    const UINT8_ARRAY = 1 << 34;
    const UINT8_CLAMPED_ARRAY = 1 << 35;
    const INT8_ARRAY = 1 << 36;
    const UINT16_ARRAY = 1 << 37;
    const INT16_ARRAY = 1 << 38;
    const UINT32_ARRAY = 1 << 39;
    const INT32_ARRAY = 1 << 40;
    const FLOAT32_ARRAY = 1 << 41;
    const FLOAT64_ARRAY = 1 << 42;
    const BIG_INT64_ARRAY = 1 << 43;
    const BIG_UINT64_ARRAY = 1 << 44;
    const DATA_VIEW = 1 << 45;
    const SHARED_ARRAY_BUFFER = 1 << 46;
    const PROXY = 1 << 47;
    const BIG_INT = 1 << 48;
    const BIG_INT_OBJECT = 1 << 49;
    const MODULE_NAMESPACE_OBJECT = 1 << 50;

    const NULLISH = Self::UNDEFINED.bits() | Self::NULL.bits();
    const BUFFER = Self::ARRAY_BUFFER.bits() | Self::ARRAY_BUFFER_VIEW.bits();
  }
}

impl Kind {
  pub(crate) fn of(value: &v8::Value) -> Kind {
    let checks: [(bool, Kind); 51] = [
      (value.is_undefined(), Kind::UNDEFINED),
      (value.is_null(), Kind::NULL),
      (value.is_name(), Kind::NAME),
      (value.is_string(), Kind::STRING),
      (value.is_symbol(), Kind::SYMBOL),
      (value.is_function(), Kind::FUNCTION),
      (value.is_array(), Kind::ARRAY),
      (value.is_object(), Kind::OBJECT),
      (value.is_boolean(), Kind::BOOLEAN),
      (value.is_number(), Kind::NUMBER),
      (value.is_external(), Kind::EXTERNAL),
      (value.is_int32(), Kind::INT32),
      (value.is_uint32(), Kind::UINT32),
      (value.is_date(), Kind::DATE),
      (value.is_arguments_object(), Kind::ARGUMENTS_OBJECT),
      (value.is_boolean_object(), Kind::BOOLEAN_OBJECT),
      (value.is_number_object(), Kind::NUMBER_OBJECT),
      (value.is_string_object(), Kind::STRING_OBJECT),
      (value.is_symbol_object(), Kind::SYMBOL_OBJECT),
      (value.is_native_error(), Kind::NATIVE_ERROR),
      (value.is_reg_exp(), Kind::REG_EXP),
      (value.is_async_function(), Kind::ASYNC_FUNCTION),
      (value.is_generator_function(), Kind::GENERATOR_FUNCTION),
      (value.is_generator_object(), Kind::GENERATOR_OBJECT),
      (value.is_promise(), Kind::PROMISE),
      (value.is_map(), Kind::MAP),
      (value.is_set(), Kind::SET),
      (value.is_map_iterator(), Kind::MAP_ITERATOR),
      (value.is_set_iterator(), Kind::SET_ITERATOR),
      (value.is_weak_map(), Kind::WEAK_MAP),
      (value.is_weak_set(), Kind::WEAK_SET),
      (value.is_array_buffer(), Kind::ARRAY_BUFFER),
      (value.is_array_buffer_view(), Kind::ARRAY_BUFFER_VIEW),
      (value.is_typed_array(), Kind::TYPED_ARRAY),
      (value.is_uint8_array(), Kind::UINT8_ARRAY),
      (value.is_uint8_clamped_array(), Kind::UINT8_CLAMPED_ARRAY),
      (value.is_int8_array(), Kind::INT8_ARRAY),
      (value.is_uint16_array(), Kind::UINT16_ARRAY),
      (value.is_int16_array(), Kind::INT16_ARRAY),
      (value.is_uint32_array(), Kind::UINT32_ARRAY),
      (value.is_int32_array(), Kind::INT32_ARRAY),
      (value.is_float32_array(), Kind::FLOAT32_ARRAY),
      (value.is_float64_array(), Kind::FLOAT64_ARRAY),
      (value.is_big_int64_array(), Kind::BIG_INT64_ARRAY),
      (value.is_big_uint64_array(), Kind::BIG_UINT64_ARRAY),
      (value.is_data_view(), Kind::DATA_VIEW),
      (value.is_shared_array_buffer(), Kind::SHARED_ARRAY_BUFFER),
      (value.is_proxy(), Kind::PROXY),
      (value.is_big_int(), Kind::BIG_INT),
      (value.is_big_int_object(), Kind::BIG_INT_OBJECT),
      (value.is_module_namespace_object(), Kind::MODULE_NAMESPACE_OBJECT),
    ];
    checks
      .into_iter()
      .filter(|(hit, _)| *hit)
      .fold(Kind::empty(), |acc, (_, kind)| acc | kind)
  }
}

impl fmt::Display for Kind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.is_empty() {
      return f.write_str("none");
    }
    let names = self
      .iter_names()
      .map(|(name, _)| name.to_ascii_lowercase())
      .join("|");
    f.write_str(&names)
  }
}

#[cfg(test)]
mod tests {
  use super::Kind;

  #[test]
  fn display_joins_lowercased_names() {
    assert_eq!((Kind::OBJECT | Kind::ARRAY).to_string(), "array|object");
    assert_eq!(Kind::empty().to_string(), "none");
  }

  #[test]
  fn aggregate_masks_intersect_members() {
    assert!(Kind::NULLISH.intersects(Kind::NULL));
    assert!(!Kind::NULLISH.intersects(Kind::OBJECT));
    assert!(Kind::BUFFER.contains(Kind::ARRAY_BUFFER));
  }
}
