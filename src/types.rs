//! Core types for the preprocessing pipeline
//!
//! Item values as they arrive from collectors, the preprocessing step model,
//! and history entries used by stateful steps.

use crate::variant::{Variant, VariantKind};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length of an item error message, in characters
pub const ITEM_ERROR_LEN: usize = 2048;

/// Declared value type of an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ValueType {
    /// Numeric (float)
    #[default]
    Float = 0,
    /// Character
    Str = 1,
    /// Log line with metadata
    Log = 2,
    /// Numeric (unsigned)
    Uint64 = 3,
    /// Text
    Text = 4,
}

impl ValueType {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ValueType::Float),
            1 => Some(ValueType::Str),
            2 => Some(ValueType::Log),
            3 => Some(ValueType::Uint64),
            4 => Some(ValueType::Text),
            _ => None,
        }
    }

    /// Variant kind a processed value is coerced to before storage
    pub fn target_kind(self) -> VariantKind {
        match self {
            ValueType::Float => VariantKind::Dbl,
            ValueType::Uint64 => VariantKind::Ui64,
            ValueType::Str | ValueType::Log | ValueType::Text => VariantKind::Str,
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, ValueType::Float | ValueType::Uint64)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Float => "Numeric (float)",
            ValueType::Str => "Character",
            ValueType::Log => "Log",
            ValueType::Uint64 => "Numeric (unsigned)",
            ValueType::Text => "Text",
        };
        f.write_str(name)
    }
}

/// Item state carried with each value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ItemState {
    #[default]
    Normal = 0,
    NotSupported = 1,
}

impl ItemState {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ItemState::Normal),
            1 => Some(ItemState::NotSupported),
            _ => None,
        }
    }
}

/// Item flags bit set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ItemFlags(pub u8);

impl ItemFlags {
    pub const NONE: ItemFlags = ItemFlags(0);
    /// Value belongs to a low-level discovery rule
    pub const DISCOVERY_RULE: ItemFlags = ItemFlags(0x01);

    #[inline]
    pub fn contains(self, other: ItemFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn is_discovery(self) -> bool {
        self.contains(Self::DISCOVERY_RULE)
    }
}

/// Item kind as far as scheduling is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    /// Values collected from the outside world
    #[default]
    Regular,
    /// Platform self-monitoring values, processed with priority
    Internal,
    /// Values derived from a master item's output
    Dependent,
}

/// Seconds/nanoseconds timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timespec {
    pub sec: i32,
    pub ns: i32,
}

impl Timespec {
    pub const fn new(sec: i32, ns: i32) -> Self {
        Self { sec, ns }
    }

    /// Current wall clock time
    pub fn now() -> Self {
        let now = chrono::Utc::now();
        Self {
            sec: now.timestamp() as i32,
            ns: now.timestamp_subsec_nanos() as i32,
        }
    }

    /// Seconds elapsed from `earlier` to `self`
    pub fn secs_since(&self, earlier: &Timespec) -> f64 {
        (self.sec as f64 - earlier.sec as f64) + (self.ns as f64 - earlier.ns as f64) / 1e9
    }
}

/// Log item metadata passed through preprocessing untouched
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LogMeta {
    pub lastlogsize: u64,
    pub mtime: i32,
    pub source: Option<String>,
    pub timestamp: i32,
    pub severity: i32,
    pub logeventid: i32,
}

/// A value submitted for preprocessing
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ItemValue {
    pub itemid: u64,
    pub value_type: ValueType,
    pub flags: ItemFlags,
    pub state: ItemState,
    /// Collected value, [`Variant::None`] when nothing was collected
    pub value: Variant,
    /// Error text for `NotSupported` values
    pub error: Option<String>,
    pub ts: Option<Timespec>,
    pub log: Option<LogMeta>,
}

impl ItemValue {
    /// A normal value for `itemid`
    pub fn new(itemid: u64, value_type: ValueType, value: impl Into<Variant>) -> Self {
        Self {
            itemid,
            value_type,
            value: value.into(),
            ..Default::default()
        }
    }

    /// An item failure collected before preprocessing
    pub fn not_supported(itemid: u64, value_type: ValueType, error: impl Into<String>) -> Self {
        Self {
            itemid,
            value_type,
            state: ItemState::NotSupported,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_ts(mut self, ts: Timespec) -> Self {
        self.ts = Some(ts);
        self
    }

    pub fn with_flags(mut self, flags: ItemFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn has_value(&self) -> bool {
        !self.value.is_none()
    }
}

/// Preprocessing step type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum StepType {
    Multiplier = 1,
    #[serde(rename = "rtrim")]
    RTrim = 2,
    #[serde(rename = "ltrim")]
    LTrim = 3,
    Trim = 4,
    RegexSubstitution = 5,
    #[serde(rename = "bool2dec")]
    Bool2Dec = 6,
    #[serde(rename = "oct2dec")]
    Oct2Dec = 7,
    #[serde(rename = "hex2dec")]
    Hex2Dec = 8,
    DeltaValue = 9,
    DeltaSpeed = 10,
    #[serde(rename = "xpath")]
    XPath = 11,
    #[serde(rename = "jsonpath")]
    JsonPath = 12,
    ValidateRange = 13,
    ValidateRegex = 14,
    ValidateNotRegex = 15,
    #[serde(rename = "error_field_json")]
    ErrorFieldJson = 16,
    #[serde(rename = "error_field_xml")]
    ErrorFieldXml = 17,
    ErrorFieldRegex = 18,
    ThrottleValue = 19,
    ThrottleTimedValue = 20,
    Script = 21,
    PrometheusPattern = 22,
    PrometheusToJson = 23,
    CsvToJson = 24,
}

impl StepType {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        use StepType::*;
        let step = match code {
            1 => Multiplier,
            2 => RTrim,
            3 => LTrim,
            4 => Trim,
            5 => RegexSubstitution,
            6 => Bool2Dec,
            7 => Oct2Dec,
            8 => Hex2Dec,
            9 => DeltaValue,
            10 => DeltaSpeed,
            11 => XPath,
            12 => JsonPath,
            13 => ValidateRange,
            14 => ValidateRegex,
            15 => ValidateNotRegex,
            16 => ErrorFieldJson,
            17 => ErrorFieldXml,
            18 => ErrorFieldRegex,
            19 => ThrottleValue,
            20 => ThrottleTimedValue,
            21 => Script,
            22 => PrometheusPattern,
            23 => PrometheusToJson,
            24 => CsvToJson,
            _ => return None,
        };
        Some(step)
    }

    /// Steps whose output depends on the previous value of the same item
    pub fn is_order_sensitive(self) -> bool {
        matches!(
            self,
            StepType::DeltaValue
                | StepType::DeltaSpeed
                | StepType::ThrottleValue
                | StepType::ThrottleTimedValue
        )
    }
}

/// What to do when a step fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ErrorHandler {
    /// Abort the chain and report the step error
    #[default]
    Default = 0,
    /// Abort the chain, leaving no value and no error
    DiscardValue = 1,
    /// Replace the failed output with a configured literal and continue
    SetValue = 2,
    /// Abort the chain with a configured error text
    SetError = 3,
    /// A step extracted an error from an otherwise valid value
    ForceError = 4,
}

impl ErrorHandler {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ErrorHandler::Default),
            1 => Some(ErrorHandler::DiscardValue),
            2 => Some(ErrorHandler::SetValue),
            3 => Some(ErrorHandler::SetError),
            4 => Some(ErrorHandler::ForceError),
            _ => None,
        }
    }

    /// Suffix shown next to a step in failure diagnostics
    pub fn label(self) -> &'static str {
        match self {
            ErrorHandler::DiscardValue => " (discard value)",
            ErrorHandler::SetValue => " (set value)",
            ErrorHandler::SetError => " (set error)",
            ErrorHandler::Default | ErrorHandler::ForceError => "",
        }
    }
}

/// One configured transformation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default)]
    pub params: String,
    #[serde(default)]
    pub error_handler: ErrorHandler,
    #[serde(default)]
    pub error_handler_params: String,
}

impl Step {
    pub fn new(step_type: StepType, params: impl Into<String>) -> Self {
        Self {
            step_type,
            params: params.into(),
            error_handler: ErrorHandler::Default,
            error_handler_params: String::new(),
        }
    }

    pub fn on_fail(mut self, handler: ErrorHandler, params: impl Into<String>) -> Self {
        self.error_handler = handler;
        self.error_handler_params = params.into();
        self
    }
}

/// Previous value and timestamp remembered by a stateful step
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HistoryValue {
    pub value: Variant,
    pub ts: Timespec,
}

impl HistoryValue {
    pub fn new(value: impl Into<Variant>, ts: Timespec) -> Self {
        Self {
            value: value.into(),
            ts,
        }
    }
}

/// History value bound to the step index that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub index: i32,
    pub value: Variant,
    pub ts: Timespec,
}

impl HistoryEntry {
    pub fn new(index: i32, history: HistoryValue) -> Self {
        Self {
            index,
            value: history.value,
            ts: history.ts,
        }
    }

    pub fn to_history_value(&self) -> HistoryValue {
        HistoryValue {
            value: self.value.clone(),
            ts: self.ts,
        }
    }
}

/// Outcome of one step in a test-mode run
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub value: Variant,
    pub error: Option<String>,
    pub action: ErrorHandler,
}

/// Truncate `text` to at most `max_len` characters, ending in "..." when cut
pub fn truncate_error(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        return text.to_string();
    }
    let keep = max_len.saturating_sub(3);
    let mut out: String = text.chars().take(keep).collect();
    out.push_str("...");
    out
}
