//! Cursor codec.
//!
//! Cursors are the consumer-visible positions inside one partition of an
//! event type. Two string forms exist:
//!
//! - legacy: `000000000000000042`, the raw physical offset of an event type
//!   that never rotated its storage;
//! - versioned: `001-0003-000000000000000042`, format version, timeline
//!   order and physical offset.
//!
//! Both forms compare lexicographically in the same order as the positions
//! they encode. The codec is pure: no I/O, no state.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Order of a timeline within its event type.
pub type TimelineOrder = u32;
/// Partition index within an event type.
pub type Partition = u32;
/// Backend-native position within one physical log partition.
pub type Offset = u64;

/// Order reported for the implicit timeline of never-rotated event types.
pub const LEGACY_ORDER: TimelineOrder = 0;
/// Highest order a versioned cursor can carry.
pub const MAX_ORDER: TimelineOrder = 9_999;
/// Highest offset an 18 digit cursor can carry.
pub const MAX_OFFSET: Offset = 999_999_999_999_999_999;
/// Keyword for "before the first retained event".
pub const BEGIN: &str = "BEGIN";

const VERSION: &str = "001";
const SEPARATOR: char = '-';
const ORDER_WIDTH: usize = 4;
const OFFSET_WIDTH: usize = 18;

/// Errors raised while decoding cursors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CursorError {
    #[error("Invalid cursor format for partition {partition}: '{offset}'")]
    InvalidCursorFormat { partition: Partition, offset: String },
}

/// Cursor as exchanged with consumers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor {
    pub partition: Partition,
    pub offset: String,
}

impl Cursor {
    pub fn new(partition: Partition, offset: impl Into<String>) -> Self {
        Self {
            partition,
            offset: offset.into(),
        }
    }

    /// Cursor positioned before the first retained event of `partition`.
    pub fn begin(partition: Partition) -> Self {
        Self::new(partition, BEGIN)
    }

    pub fn is_begin(&self) -> bool {
        self.offset == BEGIN
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.partition, self.offset)
    }
}

/// Decoded cursor position.
///
/// Field order matters: the derived ordering compares `order` first, which
/// is what makes positions comparable across timeline boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    pub order: TimelineOrder,
    pub partition: Partition,
    pub offset: Offset,
}

/// Result of decoding a cursor string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorPosition {
    Begin { partition: Partition },
    At(Position),
}

impl CursorPosition {
    pub fn partition(&self) -> Partition {
        match self {
            Self::Begin { partition } => *partition,
            Self::At(position) => position.partition,
        }
    }
}

/// Encode a position into its external cursor.
///
/// `LEGACY_ORDER` yields the legacy form so cursors handed out before an
/// event type first rotated keep their shape.
pub fn encode(order: TimelineOrder, partition: Partition, offset: Offset) -> Cursor {
    debug_assert!(order <= MAX_ORDER, "timeline order {order} exceeds cursor width");
    debug_assert!(offset <= MAX_OFFSET, "offset {offset} exceeds cursor width");

    let offset = if order == LEGACY_ORDER {
        format!("{:0width$}", offset, width = OFFSET_WIDTH)
    } else {
        format!(
            "{VERSION}{SEPARATOR}{:0ow$}{SEPARATOR}{:0fw$}",
            order,
            offset,
            ow = ORDER_WIDTH,
            fw = OFFSET_WIDTH
        )
    };
    Cursor { partition, offset }
}

/// Encode a decoded position.
pub fn encode_position(position: &Position) -> Cursor {
    encode(position.order, position.partition, position.offset)
}

/// Decode an external cursor.
pub fn decode(cursor: &Cursor) -> Result<CursorPosition, CursorError> {
    let invalid = || CursorError::InvalidCursorFormat {
        partition: cursor.partition,
        offset: cursor.offset.clone(),
    };

    if cursor.offset == BEGIN {
        return Ok(CursorPosition::Begin {
            partition: cursor.partition,
        });
    }

    let raw = cursor.offset.as_str();
    let (order, offset) = if raw.len() == OFFSET_WIDTH {
        (LEGACY_ORDER, parse_digits(raw).ok_or_else(invalid)?)
    } else {
        let mut parts = raw.split(SEPARATOR);
        let (Some(version), Some(order), Some(offset), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };
        if version != VERSION || order.len() != ORDER_WIDTH || offset.len() != OFFSET_WIDTH {
            return Err(invalid());
        }
        let order = parse_digits(order).ok_or_else(invalid)? as TimelineOrder;
        // Order 0 only has the legacy spelling.
        if order == LEGACY_ORDER {
            return Err(invalid());
        }
        (order, parse_digits(offset).ok_or_else(invalid)?)
    };

    Ok(CursorPosition::At(Position {
        order,
        partition: cursor.partition,
        offset,
    }))
}

/// Compare two cursors of the same partition.
///
/// `BEGIN` sorts before every concrete position.
pub fn compare(a: &Cursor, b: &Cursor) -> Result<Ordering, CursorError> {
    let ordering = match (decode(a)?, decode(b)?) {
        (CursorPosition::Begin { .. }, CursorPosition::Begin { .. }) => Ordering::Equal,
        (CursorPosition::Begin { .. }, CursorPosition::At(_)) => Ordering::Less,
        (CursorPosition::At(_), CursorPosition::Begin { .. }) => Ordering::Greater,
        (CursorPosition::At(x), CursorPosition::At(y)) => {
            (x.order, x.offset).cmp(&(y.order, y.offset))
        }
    };
    Ok(ordering)
}

fn parse_digits(raw: &str) -> Option<u64> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse().ok()
}
