//! Item-layer metrics.
//!
//! Counters track monotonic event totals; gauges track quantities that are
//! decremented symmetrically (current item count and byte totals). All
//! metrics register with the process-wide metriken registry for exposition.

use metriken::{metric, Counter, Gauge};

/// Item allocation requests.
#[metric(name = "item_req", description = "Item allocation requests")]
pub static ITEM_REQ: Counter = Counter::new();

/// Item allocation requests that failed for lack of memory.
#[metric(
    name = "item_req_ex",
    description = "Item allocation requests that failed"
)]
pub static ITEM_REQ_EX: Counter = Counter::new();

/// Items linked into the hash index.
#[metric(name = "item_link", description = "Items linked into the hash index")]
pub static ITEM_LINK: Counter = Counter::new();

/// Items unlinked from the hash index, including eviction reuse.
#[metric(
    name = "item_unlink",
    description = "Items unlinked from the hash index"
)]
pub static ITEM_UNLINK: Counter = Counter::new();

/// Item chunks returned to their slab class free lists.
#[metric(name = "item_remove", description = "Item chunks returned to slabs")]
pub static ITEM_REMOVE: Counter = Counter::new();

/// Items currently linked.
#[metric(name = "item_curr", description = "Items currently linked")]
pub static ITEM_CURR: Gauge = Gauge::new();

/// Key plus value bytes of currently linked items.
#[metric(
    name = "item_keyval_byte",
    description = "Key plus value bytes of linked items"
)]
pub static ITEM_KEYVAL_BYTE: Gauge = Gauge::new();

/// Value bytes of currently linked items.
#[metric(name = "item_val_byte", description = "Value bytes of linked items")]
pub static ITEM_VAL_BYTE: Gauge = Gauge::new();
