pub mod types;
pub mod value_match;
pub mod category;
pub mod alarm;
pub mod policy;
pub mod exception;

pub use types::{
    now_ts, Action, AlarmId, Direction, ExceptionId, PolicyId, SeqTier, TargetType,
};

pub use value_match::{json_comparison_match, string_value_match, value_match, value_to_text};

pub use category::{CategoryMatcher, NullCategoryMatcher, SetCategoryMatcher};

pub use alarm::{Alarm, AlarmError, AlarmState, AlarmType};

pub use policy::{domain_covers, is_private_ipv4, port_range_covers, Policy, PolicyError};

pub use exception::Exception;
